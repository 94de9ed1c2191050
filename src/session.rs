//! Per-connection orchestration between the transport and the rooms.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::registry::{normalize_code, Registry};
use crate::room::{RoomCommand, RoomEvent};
use crate::types::{ClientMsg, ConnectionId, ServerMsg};

pub const MAX_USERNAME_CHARS: usize = 20;

/// Messages buffered per connection before room events start to lag.
pub const OUTBOX_CAPACITY: usize = 64;

/// Outbound queue for one connection.
pub type Outbox = mpsc::Sender<ServerMsg>;

struct Membership {
    code: String,
    forwarder: JoinHandle<()>,
}

/// One connected client. A connection is a member of at most one room.
pub struct Session {
    connection_id: ConnectionId,
    registry: Arc<Registry>,
    outbox: Outbox,
    current: Option<Membership>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, outbox: Outbox) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            registry,
            outbox,
            current: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn current_room(&self) -> Option<&str> {
        self.current.as_ref().map(|m| m.code.as_str())
    }

    pub fn handle(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::JoinRoom { code, username } => self.join(&code, &username),
            ClientMsg::PlayerReady { code } => {
                self.route(&code, RoomCommand::Ready {
                    connection_id: self.connection_id.clone(),
                });
            }
            ClientMsg::StartGame { code } => {
                self.route(&code, RoomCommand::Start {
                    connection_id: self.connection_id.clone(),
                });
            }
            ClientMsg::LeaveRoom { code } => {
                if normalize_code(&code).as_deref() == self.current_room() {
                    self.leave();
                } else {
                    tracing::debug!(connection = %self.connection_id, %code, "leave for a room not joined");
                }
            }
            ClientMsg::SubmitAnswer {
                code,
                answer,
                time_spent_ms,
            } => {
                self.route(&code, RoomCommand::Answer {
                    connection_id: self.connection_id.clone(),
                    answer,
                    time_spent_ms: elapsed_ms(time_spent_ms.as_ref()),
                });
            }
        }
    }

    /// The transport closed. Same as leaving, from the room's point of view.
    pub fn disconnect(&mut self) {
        tracing::info!(connection = %self.connection_id, "disconnected");
        self.leave();
    }

    fn join(&mut self, raw_code: &str, raw_username: &str) {
        let Some(code) = normalize_code(raw_code) else {
            self.reject("Room code cannot be empty");
            return;
        };
        let username: String = raw_username.trim().chars().take(MAX_USERNAME_CHARS).collect();
        if username.is_empty() {
            self.reject("Username cannot be empty");
            return;
        }

        if self.current_room() == Some(code.as_str()) {
            self.registry.dispatch(&code, RoomCommand::Join {
                connection_id: self.connection_id.clone(),
                username,
            });
            return;
        }

        self.leave();

        let events = self.registry.join(&code, self.connection_id.clone(), username);
        let forwarder = tokio::spawn(forward_events(
            events,
            self.connection_id.clone(),
            self.outbox.clone(),
        ));
        self.current = Some(Membership { code, forwarder });
    }

    fn leave(&mut self) {
        let Some(membership) = self.current.take() else {
            return;
        };
        self.registry.dispatch(&membership.code, RoomCommand::Leave {
            connection_id: self.connection_id.clone(),
        });
        membership.forwarder.abort();
    }

    fn route(&self, raw_code: &str, cmd: RoomCommand) {
        match normalize_code(raw_code) {
            Some(code) => {
                self.registry.dispatch(&code, cmd);
            }
            None => tracing::debug!(connection = %self.connection_id, "event without room code ignored"),
        }
    }

    fn reject(&self, message: &str) {
        let msg = ServerMsg::ErrorMessage {
            message: message.to_string(),
        };
        if self.outbox.try_send(msg).is_err() {
            tracing::warn!(connection = %self.connection_id, "outbox full, error message dropped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Whole milliseconds from a client timing. Negative or non-numeric values count as 0.
fn elapsed_ms(value: Option<&serde_json::Value>) -> u64 {
    value
        .and_then(serde_json::Value::as_f64)
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map_or(0, |ms| ms.floor() as u64)
}

/// Relays a room's events to one connection until the room goes away.
///
/// A slow socket stalls only this task; the room's broadcast buffer then
/// overwrites what it has not read and the skipped events are logged.
async fn forward_events(
    mut events: broadcast::Receiver<RoomEvent>,
    connection_id: ConnectionId,
    outbox: Outbox,
) {
    loop {
        let msg = match events.recv().await {
            Ok(RoomEvent::Broadcast { msg }) => msg,
            Ok(RoomEvent::SendTo { connection_id: target, msg }) if target == connection_id => msg,
            Ok(RoomEvent::SendTo { .. }) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(connection = %connection_id, skipped, "connection lagging behind room events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if outbox.send(msg).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::problem::testing::FixedSource;
    use crate::room::RoomSettings;
    use crate::types::{Phase, RoomSnapshot};

    fn registry() -> Arc<Registry> {
        Registry::new(RoomSettings {
            round_seconds: 5,
            countdown_seconds: 3,
            min_players: 2,
            next_problem_delay: Duration::from_millis(200),
            fetch_timeout: Duration::from_millis(500),
            source: Arc::new(FixedSource::default()),
        })
    }

    fn only_player(room: &RoomSnapshot, username: &str) -> bool {
        room.players.len() == 1 && room.players[0].username == username
    }

    struct Client {
        session: Session,
        inbox: mpsc::Receiver<ServerMsg>,
    }

    impl Client {
        fn connect(registry: &Arc<Registry>) -> Self {
            let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
            Self {
                session: Session::new(registry.clone(), outbox),
                inbox,
            }
        }

        fn send(&mut self, msg: ClientMsg) {
            self.session.handle(msg);
        }

        fn join(&mut self, code: &str, username: &str) {
            self.send(ClientMsg::JoinRoom {
                code: code.to_string(),
                username: username.to_string(),
            });
        }

        fn ready(&mut self, code: &str) {
            self.send(ClientMsg::PlayerReady { code: code.to_string() });
        }

        async fn recv(&mut self) -> ServerMsg {
            tokio::time::timeout(Duration::from_secs(120), self.inbox.recv())
                .await
                .expect("timed out waiting for message")
                .expect("outbox closed")
        }

        async fn until<F>(&mut self, mut pred: F) -> ServerMsg
        where
            F: FnMut(&ServerMsg) -> bool,
        {
            loop {
                let msg = self.recv().await;
                if pred(&msg) {
                    return msg;
                }
            }
        }

    }

    #[tokio::test(start_paused = true)]
    async fn two_players_ready_up_and_play() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);

        ada.join("abcd", "ada");
        bob.join("ABCD", "bob");
        ada.ready("ABCD");
        bob.ready("abcd");

        for client in [&mut ada, &mut bob] {
            let mut seen = Vec::new();
            loop {
                match client.recv().await {
                    ServerMsg::RoomUpdate { .. } => {}
                    msg @ ServerMsg::Countdown { .. } => seen.push(msg),
                    msg @ ServerMsg::GameStarted => {
                        seen.push(msg);
                        break;
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(
                seen,
                vec![
                    ServerMsg::Countdown { count: 3 },
                    ServerMsg::Countdown { count: 2 },
                    ServerMsg::Countdown { count: 1 },
                    ServerMsg::Countdown { count: 0 },
                    ServerMsg::GameStarted,
                ]
            );
            let problem = client.until(|m| matches!(m, ServerMsg::NewProblem { .. })).await;
            assert_eq!(
                problem,
                ServerMsg::NewProblem {
                    question: FixedSource::QUESTION.to_string(),
                    round_number: 1
                }
            );
        }

        ada.send(ClientMsg::SubmitAnswer {
            code: "ABCD".to_string(),
            answer: Some(json!(4)),
            time_spent_ms: Some(json!(50)),
        });
        let correct = ada.until(|m| matches!(m, ServerMsg::AnswerCorrect { .. })).await;
        assert_eq!(
            correct,
            ServerMsg::AnswerCorrect {
                score_delta: 20,
                streak: 1
            }
        );

        // Bob sees the standings change but not Ada's private result.
        loop {
            match bob.recv().await {
                ServerMsg::RoomUpdate { room } if room.players[0].score == 20 => break,
                ServerMsg::AnswerCorrect { .. } => panic!("private result leaked"),
                _ => {}
            }
        }

        let ended = bob.until(|m| matches!(m, ServerMsg::GameEnded { .. })).await;
        let ServerMsg::GameEnded { rankings, .. } = ended else {
            unreachable!()
        };
        assert_eq!(rankings[0].username, "ada");
        assert_eq!(rankings[0].score, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_answer_counts_as_incorrect() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("ABCD", "ada");
        bob.join("ABCD", "bob");
        ada.ready("ABCD");
        bob.ready("ABCD");
        ada.until(|m| matches!(m, ServerMsg::NewProblem { .. })).await;

        ada.send(ClientMsg::SubmitAnswer {
            code: "ABCD".to_string(),
            answer: None,
            time_spent_ms: None,
        });
        assert_eq!(
            ada.until(|m| matches!(m, ServerMsg::AnswerIncorrect | ServerMsg::AnswerCorrect { .. }))
                .await,
            ServerMsg::AnswerIncorrect
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_inputs_are_rejected_to_sender() {
        let registry = registry();
        let mut ada = Client::connect(&registry);

        ada.join("   ", "ada");
        assert!(matches!(ada.recv().await, ServerMsg::ErrorMessage { .. }));
        ada.join("ABCD", "  ");
        assert!(matches!(ada.recv().await, ServerMsg::ErrorMessage { .. }));
        assert_eq!(registry.room_count(), 0);
        assert_eq!(ada.session.current_room(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn long_usernames_are_truncated() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        ada.join("ABCD", "  abcdefghijklmnopqrstuvwxyz  ");
        let ServerMsg::RoomUpdate { room } = ada.recv().await else {
            panic!("expected room update");
        };
        assert_eq!(room.players[0].username, "abcdefghijklmnopqrst");
    }

    #[tokio::test(start_paused = true)]
    async fn switching_rooms_leaves_the_old_one() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("AAAA", "ada");
        bob.join("AAAA", "bob");
        ada.join("BBBB", "ada");

        assert_eq!(ada.session.current_room(), Some("BBBB"));
        bob.until(|m| matches!(m, ServerMsg::RoomUpdate { room } if only_player(room, "bob")))
            .await;
        assert_eq!(registry.room_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_and_disconnect_destroy_empty_room() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("ABCD", "ada");
        bob.join("ABCD", "bob");

        ada.send(ClientMsg::LeaveRoom { code: "abcd".to_string() });
        assert_eq!(ada.session.current_room(), None);
        bob.session.disconnect();

        for _ in 0..100 {
            if registry.room_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_leaves_room() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("ABCD", "ada");
        bob.join("ABCD", "bob");
        drop(ada);

        bob.until(|m| matches!(m, ServerMsg::RoomUpdate { room } if only_player(room, "bob")))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_game_keeps_room_running() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("ABCD", "ada");
        bob.join("ABCD", "bob");
        ada.ready("ABCD");
        bob.ready("ABCD");
        bob.until(|m| matches!(m, ServerMsg::GameStarted)).await;

        ada.session.disconnect();
        let ended = bob.until(|m| matches!(m, ServerMsg::GameEnded { .. })).await;
        let ServerMsg::GameEnded { rankings, .. } = ended else {
            unreachable!()
        };
        assert_eq!(rankings.len(), 1);

        let snapshot = registry.get("ABCD").unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_other_rooms_are_ignored() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        ada.join("ABCD", "ada");
        ada.send(ClientMsg::StartGame { code: "OTHER".to_string() });
        ada.send(ClientMsg::PlayerReady { code: "".to_string() });
        ada.send(ClientMsg::LeaveRoom { code: "OTHER".to_string() });

        assert_eq!(ada.session.current_room(), Some("ABCD"));
        let snapshot = registry.get("ABCD").unwrap().snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Waiting);
    }

    #[test]
    fn client_timings_are_floored_and_clamped() {
        assert_eq!(elapsed_ms(Some(&json!(340.5))), 340);
        assert_eq!(elapsed_ms(Some(&json!(120))), 120);
        assert_eq!(elapsed_ms(Some(&json!(-3))), 0);
        assert_eq!(elapsed_ms(Some(&json!("fast"))), 0);
        assert_eq!(elapsed_ms(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_and_negative_timings_are_graded() {
        let registry = registry();
        let mut ada = Client::connect(&registry);
        let mut bob = Client::connect(&registry);
        ada.join("ABCD", "ada");
        bob.join("ABCD", "bob");
        ada.ready("ABCD");
        bob.ready("ABCD");
        ada.until(|m| matches!(m, ServerMsg::NewProblem { .. })).await;

        let answer: ClientMsg = serde_json::from_str(
            r#"{"type":"submit_answer","code":"ABCD","answer":4,"timeSpentMs":340.5}"#,
        )
        .unwrap();
        ada.send(answer);
        assert_eq!(
            ada.until(|m| matches!(m, ServerMsg::AnswerCorrect { .. } | ServerMsg::AnswerIncorrect))
                .await,
            ServerMsg::AnswerCorrect {
                score_delta: 17,
                streak: 1
            }
        );

        ada.until(|m| matches!(m, ServerMsg::NewProblem { .. })).await;
        let answer: ClientMsg = serde_json::from_str(
            r#"{"type":"submit_answer","code":"ABCD","answer":4,"timeSpentMs":-3}"#,
        )
        .unwrap();
        ada.send(answer);
        assert_eq!(
            ada.until(|m| matches!(m, ServerMsg::AnswerCorrect { .. } | ServerMsg::AnswerIncorrect))
                .await,
            ServerMsg::AnswerCorrect {
                score_delta: 22,
                streak: 2
            }
        );

        let snapshot = registry.get("ABCD").unwrap().snapshot().await.unwrap();
        let ada_row = snapshot.players.iter().find(|p| p.username == "ada").unwrap();
        assert_eq!(ada_row.total_answers, 2);
        assert_eq!(ada_row.total_time_spent_ms, 340);
    }

    #[tokio::test]
    async fn stalled_outbox_stays_bounded() {
        let (event_tx, events) = broadcast::channel(4);
        let (outbox, mut inbox) = mpsc::channel(2);
        let forwarder = tokio::spawn(forward_events(events, "c1".to_string(), outbox));

        for count in 0..20 {
            event_tx
                .send(RoomEvent::Broadcast {
                    msg: ServerMsg::Countdown { count },
                })
                .unwrap();
        }
        drop(event_tx);

        let mut seen = Vec::new();
        while let Some(msg) = inbox.recv().await {
            let ServerMsg::Countdown { count } = msg else {
                panic!("unexpected {msg:?}");
            };
            seen.push(count);
        }
        forwarder.await.unwrap();

        assert!(seen.len() <= 6, "forwarded {seen:?}");
        assert_eq!(seen.last(), Some(&19));
    }
}
