//! Points awarded per answer.
//!
//! A correct answer earns a flat base, a speed bonus that decays by one point
//! per 100 ms, and a streak bonus for the run of correct answers that came
//! before it. Everything is derived from the arguments alone.

pub const BASE_SCORE: u32 = 10;
pub const MAX_SPEED_BONUS: u32 = 10;
pub const MAX_STREAK_BONUS: u32 = 20;

/// Result of grading one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreOutcome {
    pub delta: u32,
    pub new_streak: u32,
}

pub fn speed_bonus(time_spent_ms: u64) -> u32 {
    let decay = (time_spent_ms / 100).min(u64::from(MAX_SPEED_BONUS)) as u32;
    MAX_SPEED_BONUS - decay
}

pub fn streak_bonus(prior_streak: u32) -> u32 {
    prior_streak.saturating_mul(2).min(MAX_STREAK_BONUS)
}

pub fn score(correct: bool, time_spent_ms: u64, prior_streak: u32) -> ScoreOutcome {
    if !correct {
        return ScoreOutcome {
            delta: 0,
            new_streak: 0,
        };
    }

    ScoreOutcome {
        delta: BASE_SCORE + speed_bonus(time_spent_ms) + streak_bonus(prior_streak),
        new_streak: prior_streak.saturating_add(1),
    }
}
