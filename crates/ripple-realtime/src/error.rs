//! Error types for realtime channels.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel '{0}' is not connected")]
    NotConnected(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<url::ParseError> for RealtimeError {
    fn from(err: url::ParseError) -> Self {
        RealtimeError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(err.to_string())
    }
}
