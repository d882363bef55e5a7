//! Audit logging configuration.

use serde::{Deserialize, Serialize};

/// Configuration for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Also print events to stdout.
    #[serde(default)]
    pub stdout: bool,

    /// JSON Lines file receiving events. No file output when unset.
    #[serde(default)]
    pub file_path: Option<String>,

    /// Whether to record statement text (original and rewritten).
    #[serde(default = "default_enabled")]
    pub log_statements: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            stdout: false,
            file_path: None,
            log_statements: default_enabled(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
