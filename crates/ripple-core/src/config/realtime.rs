//! Realtime channel settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the persistent-socket channel manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Socket base URL, e.g. `ws://localhost:4000/realtime`.
    #[serde(default = "default_url")]
    pub url: String,

    /// API key appended as the `apikey` query parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Reconnect after an unexpected close.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Fixed delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Consecutive failed reconnects before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Heartbeat interval while connected, in milliseconds. 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
            auto_reconnect: true,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

fn default_url() -> String {
    "ws://localhost:4000/realtime".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
