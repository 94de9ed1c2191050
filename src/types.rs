use serde::{Deserialize, Serialize};

/// Opaque per-socket identifier assigned by the transport layer.
pub type ConnectionId = String;

/// Lifecycle phase of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    CountingDown,
    Playing,
    Finished,
}

impl Phase {
    /// Phases from which a new countdown may begin.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Waiting | Self::Finished)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::CountingDown => write!(f, "counting_down"),
            Self::Playing => write!(f, "playing"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Public view of a player. Never carries the player's problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub connection_id: ConnectionId,
    pub username: String,
    pub score: u32,
    pub streak: u32,
    pub correct_answers: u32,
    pub total_answers: u32,
    pub total_time_spent_ms: u64,
    pub is_ready: bool,
    pub round_number: u32,
}

/// Room state as broadcast in `room_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub code: String,
    pub phase: Phase,
    pub round_number: u32,
    pub time_remaining_seconds: u32,
    pub players: Vec<PlayerSnapshot>,
}

/// Aggregate numbers reported when a game ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStats {
    pub total_rounds: u32,
    pub duration_ms: u64,
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    // Room-wide
    RoomUpdate {
        room: RoomSnapshot,
    },
    Countdown {
        count: u32,
    },
    GameStarted,
    TimeUpdate {
        seconds_remaining: u32,
    },
    GameEnded {
        rankings: Vec<PlayerSnapshot>,
        game_stats: GameStats,
    },

    // Single player
    NewProblem {
        question: String,
        round_number: u32,
    },
    AnswerCorrect {
        score_delta: u32,
        streak: u32,
    },
    AnswerIncorrect,
    ErrorMessage {
        message: String,
    },
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    JoinRoom {
        code: String,
        username: String,
    },
    PlayerReady {
        code: String,
    },
    StartGame {
        code: String,
    },
    LeaveRoom {
        code: String,
    },
    SubmitAnswer {
        code: String,
        #[serde(default)]
        answer: Option<serde_json::Value>,
        /// Client-measured, so any JSON number is accepted here.
        #[serde(default)]
        time_spent_ms: Option<serde_json::Value>,
    },
}
