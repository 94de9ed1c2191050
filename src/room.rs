//! Room actor: one tokio task per room code.
//!
//! The task owns the room's players, phase and timers exclusively. Commands
//! arrive on an unbounded mpsc channel and are applied one at a time,
//! interleaved with countdown and round ticks in a single `select!` loop, so
//! every transition of a room is totally ordered. Outbound messages go out on
//! a broadcast channel that connection forwarders subscribe to.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval};

use crate::player::{AnswerOutcome, PlayerRecord};
use crate::problem::{self, Problem, ProblemSource};
use crate::types::*;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Per-room tuning shared by every room in the process.
#[derive(Clone)]
pub struct RoomSettings {
    pub round_seconds: u32,
    pub countdown_seconds: u32,
    pub min_players: usize,
    pub next_problem_delay: Duration,
    pub fetch_timeout: Duration,
    pub source: Arc<dyn ProblemSource>,
}

/// Commands the registry and sessions send to a room task.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        connection_id: ConnectionId,
        username: String,
    },
    Ready {
        connection_id: ConnectionId,
    },
    Start {
        connection_id: ConnectionId,
    },
    Leave {
        connection_id: ConnectionId,
    },
    Answer {
        connection_id: ConnectionId,
        answer: Option<serde_json::Value>,
        time_spent_ms: u64,
    },
    /// Completion of a problem fetch started by this room.
    ProblemReady {
        connection_id: ConnectionId,
        game_epoch: u64,
        problem: Problem,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Shutdown,
}

/// Events published by a room to its members' connections.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Deliver to every member of the room.
    Broadcast { msg: ServerMsg },
    /// Deliver to one member only.
    SendTo {
        connection_id: ConnectionId,
        msg: ServerMsg,
    },
}

#[derive(Clone)]
pub struct RoomHandle {
    pub code: String,
    cmd_tx: mpsc::UnboundedSender<RoomCommand>,
    event_tx: broadcast::Sender<RoomEvent>,
}

impl RoomHandle {
    /// Queues a command. Returns `false` if the room task has exited.
    pub fn send(&self, cmd: RoomCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_tx.subscribe()
    }

    pub async fn snapshot(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(RoomCommand::Snapshot { reply }) {
            return None;
        }
        rx.await.ok()
    }

    pub fn is_same_room(&self, other: &RoomHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }
}

/// The internal state of one room.
struct RoomState {
    code: String,
    settings: RoomSettings,
    players: Vec<PlayerRecord>,
    phase: Phase,
    round_number: u32,
    time_remaining_seconds: u32,
    started_at: Option<Instant>,

    countdown_in_flight: bool,
    countdown_remaining: u32,
    countdown: Option<Interval>,
    round_timer: Option<Interval>,

    /// Bumped on every game start and finish; stale fetch results carry an old value.
    game_epoch: u64,
    fetch_seq: u64,

    /// This room's own channels, as handed to the registry.
    handle: RoomHandle,
}

impl RoomState {
    fn broadcast(&self, msg: ServerMsg) {
        let _ = self.handle.event_tx.send(RoomEvent::Broadcast { msg });
    }

    fn send_to(&self, connection_id: &str, msg: ServerMsg) {
        let _ = self.handle.event_tx.send(RoomEvent::SendTo {
            connection_id: connection_id.to_string(),
            msg,
        });
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            code: self.code.clone(),
            phase: self.phase,
            round_number: self.round_number,
            time_remaining_seconds: self.time_remaining_seconds,
            players: self.players.iter().map(PlayerRecord::snapshot).collect(),
        }
    }

    fn broadcast_room(&self) {
        self.broadcast(ServerMsg::RoomUpdate {
            room: self.snapshot(),
        });
    }

    fn player_mut(&mut self, connection_id: &str) -> Option<&mut PlayerRecord> {
        self.players.iter_mut().find(|p| p.connection_id == connection_id)
    }

    fn is_member(&self, connection_id: &str) -> bool {
        self.players.iter().any(|p| p.connection_id == connection_id)
    }

    /// Starts a fetch for one player; the result comes back as `ProblemReady`.
    fn request_problem(&mut self, connection_id: &str, delay: Duration) {
        self.fetch_seq += 1;
        let seed = self.fetch_seq;
        let game_epoch = self.game_epoch;
        let source = self.settings.source.clone();
        let timeout = self.settings.fetch_timeout;
        let cmd_tx = self.handle.cmd_tx.clone();
        let target = connection_id.to_string();

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let problem = problem::fetch_with_fallback(source, timeout, seed).await;
            let _ = cmd_tx.send(RoomCommand::ProblemReady {
                connection_id: target,
                game_epoch,
                problem,
            });
        });

        match self.player_mut(connection_id) {
            Some(player) => player.set_pending_fetch(task.abort_handle()),
            None => task.abort(),
        }
    }

    fn start_countdown(&mut self) {
        if self.countdown_in_flight || !self.phase.can_start() || self.players.is_empty() {
            return;
        }

        self.phase = Phase::CountingDown;
        self.countdown_in_flight = true;
        self.countdown_remaining = self.settings.countdown_seconds;
        self.countdown = Some(tokio::time::interval(Duration::from_secs(1)));

        tracing::info!(room = %self.code, players = self.players.len(), "countdown started");
        self.broadcast_room();
    }

    fn maybe_auto_start(&mut self) {
        if self.phase.can_start()
            && self.players.len() >= self.settings.min_players
            && self.players.iter().all(|p| p.is_ready)
        {
            self.start_countdown();
        }
    }

    fn begin_play(&mut self) {
        self.countdown = None;
        self.countdown_in_flight = false;

        self.phase = Phase::Playing;
        self.round_number = 1;
        self.started_at = Some(Instant::now());
        self.game_epoch += 1;
        self.time_remaining_seconds = self.settings.round_seconds;
        for player in &mut self.players {
            player.reset_for_game();
        }

        let period = Duration::from_secs(1);
        self.round_timer = Some(tokio::time::interval_at(Instant::now() + period, period));

        tracing::info!(room = %self.code, players = self.players.len(), "game started");
        self.broadcast(ServerMsg::GameStarted);
        self.broadcast_room();

        let ids: Vec<ConnectionId> = self.players.iter().map(|p| p.connection_id.clone()).collect();
        for id in ids {
            self.request_problem(&id, Duration::ZERO);
        }
    }

    fn finish(&mut self) {
        self.round_timer = None;
        self.phase = Phase::Finished;
        self.game_epoch += 1;

        for player in &mut self.players {
            player.cancel_fetch();
            player.current_problem = None;
            player.is_ready = false;
        }

        let total_rounds = self
            .players
            .iter()
            .map(|p| p.round_number)
            .max()
            .unwrap_or(0)
            .max(self.round_number);
        let duration_ms = self
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        // Stable sort keeps join order among equal scores.
        let mut rankings: Vec<PlayerSnapshot> = self.players.iter().map(PlayerRecord::snapshot).collect();
        rankings.sort_by(|a, b| b.score.cmp(&a.score));

        tracing::info!(room = %self.code, total_rounds, duration_ms, "game finished");
        self.broadcast(ServerMsg::GameEnded {
            rankings,
            game_stats: GameStats {
                total_rounds,
                duration_ms,
            },
        });
        self.broadcast_room();
    }
}

/// Spawns the task for a new, empty room.
///
/// `rooms` is the registry's map; the task removes its own entry once the last
/// player has left.
pub fn spawn_room(
    code: String,
    settings: RoomSettings,
    rooms: Arc<DashMap<String, RoomHandle>>,
) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

    let handle = RoomHandle {
        code: code.clone(),
        cmd_tx,
        event_tx,
    };

    let state = RoomState {
        code,
        settings,
        players: Vec::new(),
        phase: Phase::Waiting,
        round_number: 0,
        time_remaining_seconds: 0,
        started_at: None,
        countdown_in_flight: false,
        countdown_remaining: 0,
        countdown: None,
        round_timer: None,
        game_epoch: 0,
        fetch_seq: 0,
        handle: handle.clone(),
    };

    tracing::info!(room = %state.code, "room created");
    tokio::spawn(room_task(state, cmd_rx, rooms));

    handle
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn room_task(
    mut state: RoomState,
    mut cmd_rx: mpsc::UnboundedReceiver<RoomCommand>,
    rooms: Arc<DashMap<String, RoomHandle>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(RoomCommand::Shutdown) | None => break,
                Some(cmd) => handle_command(&mut state, cmd),
            },
            _ = next_tick(&mut state.countdown) => handle_countdown_tick(&mut state),
            _ = next_tick(&mut state.round_timer) => handle_round_tick(&mut state),
        }

        if state.players.is_empty() && retire(&state, &cmd_rx, &rooms) {
            break;
        }
    }

    // Timers and player records (with their fetches) go with the state.
    tracing::info!(room = %state.code, "room destroyed");
}

/// Removes this room from the registry if nothing is queued for it.
///
/// Joins are enqueued while holding the map entry, so checking the inbox under
/// the same entry lock cannot miss one. Returns `true` when the task should exit.
fn retire(
    state: &RoomState,
    cmd_rx: &mpsc::UnboundedReceiver<RoomCommand>,
    rooms: &DashMap<String, RoomHandle>,
) -> bool {
    let mut detached = true;
    let removed = rooms.remove_if(&state.code, |_, handle| {
        if handle.is_same_room(&state.handle) {
            detached = false;
            cmd_rx.is_empty()
        } else {
            false
        }
    });
    removed.is_some() || detached
}

fn handle_command(state: &mut RoomState, cmd: RoomCommand) {
    match cmd {
        RoomCommand::Join {
            connection_id,
            username,
        } => handle_join(state, connection_id, username),
        RoomCommand::Ready { connection_id } => handle_ready(state, &connection_id),
        RoomCommand::Start { connection_id } => {
            if state.is_member(&connection_id) {
                state.start_countdown();
            }
        }
        RoomCommand::Leave { connection_id } => handle_leave(state, &connection_id),
        RoomCommand::Answer {
            connection_id,
            answer,
            time_spent_ms,
        } => handle_answer(state, &connection_id, answer, time_spent_ms),
        RoomCommand::ProblemReady {
            connection_id,
            game_epoch,
            problem,
        } => handle_problem_ready(state, &connection_id, game_epoch, problem),
        RoomCommand::Snapshot { reply } => {
            let _ = reply.send(state.snapshot());
        }
        RoomCommand::Shutdown => {}
    }
}

fn handle_join(state: &mut RoomState, connection_id: ConnectionId, username: String) {
    if let Some(player) = state.player_mut(&connection_id) {
        player.username = username;
        state.broadcast_room();
        return;
    }

    tracing::info!(room = %state.code, connection = %connection_id, %username, "player joined");
    state.players.push(PlayerRecord::new(connection_id.clone(), username));

    if state.phase == Phase::Playing {
        state.request_problem(&connection_id, Duration::ZERO);
    }
    state.broadcast_room();
}

fn handle_ready(state: &mut RoomState, connection_id: &str) {
    if !state.phase.can_start() {
        return;
    }
    let Some(player) = state.player_mut(connection_id) else {
        return;
    };
    player.is_ready = true;

    state.broadcast_room();
    state.maybe_auto_start();
}

fn handle_leave(state: &mut RoomState, connection_id: &str) {
    let Some(index) = state.players.iter().position(|p| p.connection_id == connection_id) else {
        return;
    };
    let player = state.players.remove(index);
    tracing::info!(room = %state.code, connection = %connection_id, username = %player.username, "player left");
    drop(player);

    if state.players.is_empty() {
        return;
    }

    state.broadcast_room();
    if state.phase == Phase::Waiting {
        state.maybe_auto_start();
    }
}

fn handle_answer(
    state: &mut RoomState,
    connection_id: &str,
    answer: Option<serde_json::Value>,
    time_spent_ms: u64,
) {
    if state.phase != Phase::Playing {
        return;
    }
    let Some(player) = state.player_mut(connection_id) else {
        return;
    };
    let Some(outcome) = player.record_answer(answer.as_ref(), time_spent_ms) else {
        tracing::debug!(connection = %connection_id, "answer without an assigned problem ignored");
        return;
    };

    match outcome {
        AnswerOutcome::Correct { score_delta, streak } => {
            state.send_to(connection_id, ServerMsg::AnswerCorrect { score_delta, streak });
        }
        AnswerOutcome::Incorrect => {
            state.send_to(connection_id, ServerMsg::AnswerIncorrect);
        }
    }
    state.broadcast_room();

    let delay = state.settings.next_problem_delay;
    state.request_problem(connection_id, delay);
}

fn handle_problem_ready(state: &mut RoomState, connection_id: &str, game_epoch: u64, problem: Problem) {
    if game_epoch != state.game_epoch || state.phase != Phase::Playing {
        tracing::debug!(room = %state.code, connection = %connection_id, "stale problem discarded");
        return;
    }
    let Some(player) = state.player_mut(connection_id) else {
        tracing::debug!(room = %state.code, connection = %connection_id, "problem for departed player discarded");
        return;
    };

    let question = problem.question.clone();
    let round_number = player.assign_problem(problem);
    state.round_number = state.round_number.max(round_number);
    state.send_to(connection_id, ServerMsg::NewProblem { question, round_number });
}

fn handle_countdown_tick(state: &mut RoomState) {
    if state.phase != Phase::CountingDown {
        state.countdown = None;
        state.countdown_in_flight = false;
        return;
    }

    state.broadcast(ServerMsg::Countdown {
        count: state.countdown_remaining,
    });
    if state.countdown_remaining == 0 {
        state.begin_play();
    } else {
        state.countdown_remaining -= 1;
    }
}

fn handle_round_tick(state: &mut RoomState) {
    if state.phase != Phase::Playing {
        state.round_timer = None;
        return;
    }

    state.time_remaining_seconds = state.time_remaining_seconds.saturating_sub(1);
    state.broadcast(ServerMsg::TimeUpdate {
        seconds_remaining: state.time_remaining_seconds,
    });

    if state.time_remaining_seconds == 0 {
        state.finish();
    }
}
