//! Audit failures. Callers log these and carry on; a failed audit write never
//! fails the query it describes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// The in-memory event store was poisoned by a panicking writer.
    #[error("audit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("could not encode audit event: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
