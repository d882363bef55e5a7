//! Row-level security configuration.
//!
//! This module declares which tables are RLS-enabled, which roles may run
//! privileged statements, and the policy definitions loaded into the policy
//! engine at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use super::ConfigError;

/// Statement kind a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperation {
    #[serde(alias = "SELECT")]
    Select,
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
    #[serde(alias = "ALL")]
    All,
}

impl PolicyOperation {
    /// Whether a policy declared for `self` covers a statement of kind `other`.
    pub fn covers(self, other: PolicyOperation) -> bool {
        self == PolicyOperation::All || self == other
    }
}

impl fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::All => write!(f, "ALL"),
        }
    }
}

/// A single access policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    /// Unique policy identifier.
    pub id: String,

    /// Table name, `*`, or a glob such as `orders_*`.
    pub table: String,

    /// Statement kind the policy covers.
    #[serde(default = "default_operation")]
    pub operation: PolicyOperation,

    /// Roles the policy applies to.
    pub roles: Vec<String>,

    /// Predicate template. May reference `auth.uid()`, `auth.tenant_id()`,
    /// `auth.role()` and `auth.email()`.
    pub condition: String,

    /// Disabled policies are ignored during matching.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Configuration for row-level security.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlsConfig {
    /// Tables on which RLS is enforced (fail-closed).
    #[serde(default)]
    pub enabled_tables: Vec<String>,

    /// Roles allowed to run CREATE/DROP/ALTER statements.
    #[serde(default = "default_elevated_roles")]
    pub elevated_roles: Vec<String>,

    /// Policy definitions.
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            enabled_tables: Vec::new(),
            elevated_roles: default_elevated_roles(),
            policies: Vec::new(),
        }
    }
}

impl RlsConfig {
    /// Load RLS configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load RLS configuration from a path relative to a base directory.
    ///
    /// Absolute paths are used directly. A missing file is an error.
    pub fn load_from_path(
        rls_file: impl AsRef<Path>,
        base_dir: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let rls_file = rls_file.as_ref();
        let rls_path = if rls_file.is_absolute() {
            rls_file.to_path_buf()
        } else {
            base_dir.as_ref().join(rls_file)
        };

        if rls_path.exists() {
            Self::from_file(&rls_path)
        } else {
            Err(ConfigError::Config(format!(
                "RLS file not found: {}",
                rls_path.display()
            )))
        }
    }

    /// Parse RLS configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Append tables and policies from `other`. Elevated roles are unioned.
    pub fn merge(&mut self, other: RlsConfig) {
        for table in other.enabled_tables {
            if !self.enabled_tables.contains(&table) {
                self.enabled_tables.push(table);
            }
        }
        for role in other.elevated_roles {
            if !self.elevated_roles.contains(&role) {
                self.elevated_roles.push(role);
            }
        }
        self.policies.extend(other.policies);
    }

    /// Check that policy ids are unique and every policy is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.id.as_str()) {
                return Err(ConfigError::Config(format!(
                    "duplicate policy id '{}'",
                    policy.id
                )));
            }
            if policy.table.trim().is_empty() {
                return Err(ConfigError::Config(format!(
                    "policy '{}' has an empty table pattern",
                    policy.id
                )));
            }
            if policy.roles.is_empty() {
                return Err(ConfigError::Config(format!(
                    "policy '{}' must list at least one role",
                    policy.id
                )));
            }
        }
        Ok(())
    }
}

fn default_operation() -> PolicyOperation {
    PolicyOperation::All
}

fn default_true() -> bool {
    true
}

fn default_elevated_roles() -> Vec<String> {
    vec!["admin".to_string(), "service_role".to_string()]
}
