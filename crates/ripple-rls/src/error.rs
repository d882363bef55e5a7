//! Error types for the RLS crate.

use thiserror::Error;

/// Errors raised while checking or rewriting a statement.
#[derive(Debug, Error)]
pub enum RlsError {
    /// A table with RLS enabled has no applicable policy for the caller.
    #[error("access denied: no {operation} policy on table '{table}' for role '{role}'")]
    AccessDenied {
        table: String,
        operation: String,
        role: String,
    },

    /// CREATE/DROP/ALTER/TRUNCATE without an elevated role.
    #[error("access denied: {operation} requires an elevated role (caller has '{role}')")]
    PrivilegedOperation { operation: String, role: String },

    /// Statement shape the rewriter cannot scope safely.
    #[error("cannot scope statement: {reason}")]
    UnscopableStatement { reason: String },

    /// A policy with the same id is already registered.
    #[error("policy '{0}' is already registered")]
    DuplicatePolicy(String),

    /// Table pattern could not be compiled.
    #[error("invalid table pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// SQL parsing failed.
    #[error("failed to parse SQL: {0}")]
    ParseError(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RlsError {
    /// Whether this error is a fail-closed denial.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            RlsError::AccessDenied { .. }
                | RlsError::PrivilegedOperation { .. }
                | RlsError::UnscopableStatement { .. }
        )
    }
}
