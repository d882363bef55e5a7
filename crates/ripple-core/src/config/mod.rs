//! Configuration types for Ripple.
//!
//! All Ripple crates read their settings from the types in this module.
//! Configuration is loaded from a YAML file (ripple.yaml) and, optionally, a
//! separate policy file referenced by `rls_file`.
//!
//! # Configuration Files
//!
//! - **ripple.yaml**: endpoint, query, realtime, audit and observability settings
//! - **policies.yaml**: row-level security policies and RLS-enabled tables

pub mod audit;
pub mod endpoint;
pub mod query;
pub mod realtime;
pub mod rls;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use audit::AuditConfig;
pub use endpoint::EndpointConfig;
pub use query::{QueryConfig, RowFormat};
pub use realtime::RealtimeConfig;
pub use rls::{PolicyDefinition, PolicyOperation, RlsConfig};

/// Complete Ripple configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RippleConfig {
    /// Project name.
    #[serde(default)]
    pub project: Option<String>,

    /// Query engine endpoint.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Pull/push query behaviour.
    #[serde(default)]
    pub query: QueryConfig,

    /// Realtime channel settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Row-level security (inline or from file).
    #[serde(default)]
    pub rls: RlsConfig,

    /// Path to a row-level security file (alternative to inline).
    #[serde(default)]
    pub rls_file: Option<PathBuf>,

    /// Audit logging.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RippleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration and resolve the external policy file.
    ///
    /// A relative `rls_file` is resolved against the directory holding the
    /// main configuration file. Policies and RLS-enabled tables from the file
    /// are appended to any declared inline.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(rls_file) = config.rls_file.clone() {
            let external = RlsConfig::load_from_path(&rls_file, &base_dir)?;
            config.rls.merge(external);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint.validate()?;
        self.rls.validate()?;
        Ok(())
    }
}
