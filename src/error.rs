use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while preparing or loading the config directory.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a problem could not be obtained from a problem source.
#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("problem source request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("problem source returned an invalid problem: {0}")]
    Invalid(String),

    #[error("problem source timed out after {0:?}")]
    Timeout(Duration),

    #[error("problem source unavailable: {0}")]
    Unavailable(String),
}
