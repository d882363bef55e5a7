//! # ripple-core
//!
//! Types shared by every Ripple crate:
//!
//! - [`config`]: YAML configuration for endpoints, queries, realtime channels,
//!   row-level security and audit logging
//! - [`ExecutionContext`]: the identity a request runs under
//! - [`telemetry`]: tracing subscriber setup

pub mod config;
pub mod context;
pub mod telemetry;

pub use config::{
    AuditConfig, ConfigError, EndpointConfig, ObservabilityConfig, PolicyDefinition,
    PolicyOperation, QueryConfig, RealtimeConfig, RippleConfig, RlsConfig, RowFormat,
};
pub use context::ExecutionContext;
