//! Error types for the server core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid value for setting {key}: {value}")]
    InvalidSetting { key: String, value: String },

    #[error("no free session id")]
    NoFreeSessionId,

    #[error("unknown session {0}")]
    UnknownSession(u16),

    #[error("level not found: {0}")]
    LevelNotFound(String),
}

/// Request to tear a session down.
///
/// The reason, when present, is sent to the peer as a disconnect message
/// before the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: Option<String>,
}

impl Disconnect {
    pub fn silent() -> Self {
        Self { reason: None }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of handling one record
pub type HandlerResult = Result<(), Disconnect>;
