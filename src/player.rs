use tokio::task::AbortHandle;

use crate::problem::Problem;
use crate::scoring;
use crate::types::{ConnectionId, PlayerSnapshot};

/// Result of grading a submission, as told to the submitting player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Correct { score_delta: u32, streak: u32 },
    Incorrect,
}

/// A participant inside one room.
///
/// Dropping the record cancels any problem fetch still running for it.
#[derive(Debug)]
pub struct PlayerRecord {
    pub connection_id: ConnectionId,
    pub username: String,
    pub score: u32,
    pub streak: u32,
    pub correct_answers: u32,
    pub total_answers: u32,
    pub total_time_spent_ms: u64,
    pub is_ready: bool,
    pub current_problem: Option<Problem>,
    pub round_number: u32,
    pending_fetch: Option<AbortHandle>,
}

impl PlayerRecord {
    pub fn new(connection_id: ConnectionId, username: String) -> Self {
        Self {
            connection_id,
            username,
            score: 0,
            streak: 0,
            correct_answers: 0,
            total_answers: 0,
            total_time_spent_ms: 0,
            is_ready: false,
            current_problem: None,
            round_number: 0,
            pending_fetch: None,
        }
    }

    /// Zeroes every per-game counter and forgets the current problem.
    pub fn reset_for_game(&mut self) {
        self.cancel_fetch();
        self.score = 0;
        self.streak = 0;
        self.correct_answers = 0;
        self.total_answers = 0;
        self.total_time_spent_ms = 0;
        self.current_problem = None;
        self.round_number = 0;
    }

    /// Grades `submitted` against this player's own problem and consumes it.
    ///
    /// Returns `None` when no problem is assigned.
    pub fn record_answer(
        &mut self,
        submitted: Option<&serde_json::Value>,
        time_spent_ms: u64,
    ) -> Option<AnswerOutcome> {
        let problem = self.current_problem.take()?;

        self.total_answers += 1;
        self.total_time_spent_ms = self.total_time_spent_ms.saturating_add(time_spent_ms);

        let correct = problem.is_answered_by(submitted);
        let outcome = scoring::score(correct, time_spent_ms, self.streak);
        self.streak = outcome.new_streak;

        if correct {
            self.correct_answers += 1;
            self.score = self.score.saturating_add(outcome.delta);
            Some(AnswerOutcome::Correct {
                score_delta: outcome.delta,
                streak: outcome.new_streak,
            })
        } else {
            Some(AnswerOutcome::Incorrect)
        }
    }

    /// Installs a freshly fetched problem and advances this player's round.
    pub fn assign_problem(&mut self, problem: Problem) -> u32 {
        self.pending_fetch = None;
        self.current_problem = Some(problem);
        self.round_number += 1;
        self.round_number
    }

    pub fn set_pending_fetch(&mut self, handle: AbortHandle) {
        self.cancel_fetch();
        self.pending_fetch = Some(handle);
    }

    pub fn cancel_fetch(&mut self) {
        if let Some(handle) = self.pending_fetch.take() {
            handle.abort();
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            connection_id: self.connection_id.clone(),
            username: self.username.clone(),
            score: self.score,
            streak: self.streak,
            correct_answers: self.correct_answers,
            total_answers: self.total_answers,
            total_time_spent_ms: self.total_time_spent_ms,
            is_ready: self.is_ready,
            round_number: self.round_number,
        }
    }
}

impl Drop for PlayerRecord {
    fn drop(&mut self) {
        self.cancel_fetch();
    }
}
