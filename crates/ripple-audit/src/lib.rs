//! # ripple-audit
//!
//! Audit logging for Ripple.
//!
//! This crate records:
//! - Row-level security decisions (predicates applied, access denied)
//! - Pull query outcomes (executed / failed)
//! - Push query lifecycle (started / terminated)
//!
//! ## Event Types
//!
//! | Event Type | Description |
//! |------------|-------------|
//! | `PolicyApplied` | Predicates were spliced into a statement |
//! | `AccessDenied` | Statement rejected before reaching the backend |
//! | `QueryExecuted` | Pull query completed |
//! | `QueryFailed` | Pull query failed, or a push query failed to start |
//! | `StreamStarted` | Push query began streaming |
//! | `StreamTerminated` | Push query was terminated or completed |
//!
//! ## Storage
//!
//! - **File output**: JSON Lines (one JSON object per line)
//! - **Console output**: human-readable log lines
//! - **Memory**: for tests and short-lived processes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ripple_audit::AuditLogger;
//! use ripple_core::{AuditConfig, ExecutionContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let logger = AuditLogger::new(AuditConfig::default())?;
//! let ctx = ExecutionContext::new("u1", "acme", "user");
//!
//! logger
//!     .log_query_executed(&ctx, "SELECT * FROM orders;", 42, 15)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod logger;
pub mod storage;

pub use error::AuditError;
pub use event::{AuditEvent, AuditEventBuilder, AuditEventType};
pub use logger::{AuditFilter, AuditLogger};
pub use storage::{
    AuditStorage, ConsoleStorage, DualStorage, FileStorage, MemoryStorage, NullStorage,
};
