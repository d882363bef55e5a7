//! Pull/push query settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How rows are presented to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowFormat {
    /// Rows stay positional arrays, aligned with the header's column names.
    #[default]
    Positional,
    /// Rows become maps keyed by column name.
    Keyed,
}

/// Query execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Timeout for a whole pull query, in milliseconds. Push queries never time out.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for establishing the TCP/TLS connection, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Retries for pull queries on connect or timeout errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Row presentation.
    #[serde(default)]
    pub row_format: RowFormat,

    /// Properties sent with every statement unless overridden.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            row_format: RowFormat::default(),
            properties: BTreeMap::new(),
        }
    }
}

impl QueryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}
