use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::problem::{HttpProblemSource, LocalProblemSource, ProblemSource};
use crate::room::RoomSettings;

/// Round window presets for the two deployment profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundProfile {
    #[default]
    Sprint,
    Marathon,
}

impl RoundProfile {
    pub fn round_seconds(self) -> u32 {
        match self {
            Self::Sprint => 30,
            Self::Marathon => 90,
        }
    }
}

/// Where new problems come from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProblemSourceConfig {
    #[default]
    Local,
    Http { url: String },
}

/// Game configuration loaded from game.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameConfig {
    pub profile: RoundProfile,
    /// Overrides the profile's round window when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_seconds: Option<u32>,
    pub countdown_seconds: u32,
    /// Players needed before an all-ready room starts on its own.
    pub min_players: usize,
    pub next_problem_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub problem_source: ProblemSourceConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            profile: RoundProfile::default(),
            round_seconds: None,
            countdown_seconds: 3,
            min_players: 2,
            next_problem_delay_ms: 1000,
            fetch_timeout_ms: 2000,
            problem_source: ProblemSourceConfig::default(),
        }
    }
}

impl GameConfig {
    pub fn round_seconds(&self) -> u32 {
        self.round_seconds.unwrap_or_else(|| self.profile.round_seconds())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_seconds() == 0 {
            return Err(ConfigError::Invalid("roundSeconds must be positive".to_string()));
        }
        if self.countdown_seconds == 0 {
            return Err(ConfigError::Invalid("countdownSeconds must be positive".to_string()));
        }
        if self.min_players == 0 {
            return Err(ConfigError::Invalid("minPlayers must be at least 1".to_string()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fetchTimeoutMs must be positive".to_string()));
        }
        if let ProblemSourceConfig::Http { url } = &self.problem_source {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("problem source url {url:?} is not http(s)")));
            }
        }
        Ok(())
    }

    pub fn problem_source(&self) -> Result<Arc<dyn ProblemSource>, ConfigError> {
        Ok(match &self.problem_source {
            ProblemSourceConfig::Local => Arc::new(LocalProblemSource),
            ProblemSourceConfig::Http { url } => Arc::new(
                HttpProblemSource::new(url.clone())
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
        })
    }

    pub fn room_settings(&self, source: Arc<dyn ProblemSource>) -> RoomSettings {
        RoomSettings {
            round_seconds: self.round_seconds(),
            countdown_seconds: self.countdown_seconds,
            min_players: self.min_players,
            next_problem_delay: Duration::from_millis(self.next_problem_delay_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            source,
        }
    }
}

/// The config directory named by `CONFIG_PATH`.
pub fn config_dir() -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    PathBuf::from(base)
}

/// Creates the config directory and a default game.json if missing.
pub fn init(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let game_path = dir.join("game.json");
    if !game_path.exists() {
        let data = serde_json::to_string_pretty(&GameConfig::default()).map_err(|source| {
            ConfigError::Parse {
                path: game_path.clone(),
                source,
            }
        })?;
        fs::write(&game_path, data).map_err(|source| ConfigError::Io {
            path: game_path.clone(),
            source,
        })?;
        tracing::info!(path = %game_path.display(), "wrote default game config");
    }

    Ok(())
}

/// Load and validate the game configuration.
pub fn load_game_config(dir: &Path) -> Result<GameConfig, ConfigError> {
    let path = dir.join("game.json");
    let data = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config: GameConfig =
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse { path, source })?;
    config.validate()?;
    Ok(config)
}
