//! Error types for query execution.

use ripple_query::BuildError;
use ripple_rls::RlsError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Broad category of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed descriptor or unsupported operator.
    Validation,
    /// Denied by row-level security or missing an elevated role.
    AccessDenied,
    /// Network failure, timeout or non-success HTTP status.
    Transport,
    /// Response could not be understood.
    Parse,
    /// The engine returned a structured error.
    Backend,
    /// Everything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Transport => "transport",
            ErrorKind::Parse => "parse",
            ErrorKind::Backend => "backend",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`QueryClient`](crate::QueryClient) and [`Ripple`](crate::Ripple).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid query: {0}")]
    Validation(#[from] BuildError),

    #[error("{0}")]
    AccessDenied(RlsError),

    #[error("policy engine error: {0}")]
    Policy(RlsError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unreadable response: {0}")]
    Parse(String),

    #[error("engine error {error_code}: {message}")]
    Backend { error_code: i64, message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Validation(_) => ErrorKind::Validation,
            ClientError::AccessDenied(_) => ErrorKind::AccessDenied,
            ClientError::Transport(_) | ClientError::Timeout(_) | ClientError::Status { .. } => {
                ErrorKind::Transport
            }
            ClientError::Parse(_) => ErrorKind::Parse,
            ClientError::Backend { .. } => ErrorKind::Backend,
            ClientError::Policy(_) | ClientError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map a reqwest error, reporting timeouts as [`ClientError::Timeout`].
    pub(crate) fn from_transport(err: reqwest::Error, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(limit) if err.is_timeout() => ClientError::Timeout(limit),
            _ => ClientError::Transport(err),
        }
    }
}

impl From<RlsError> for ClientError {
    fn from(err: RlsError) -> Self {
        if err.is_denial() {
            ClientError::AccessDenied(err)
        } else {
            ClientError::Policy(err)
        }
    }
}
