//! Execution context supplied by the caller's authentication layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity a single request runs under.
///
/// Produced by an external credential/session service and treated as already
/// validated. The context is immutable once built; a new request gets a new
/// context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Subject (user or service) identifier.
    pub subject_id: String,
    /// Tenant the subject acts for.
    pub tenant_id: String,
    /// Primary role.
    pub role: String,
    /// All roles held, always including `role`.
    pub roles: BTreeSet<String>,
    /// Email address, when the identity provider supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ExecutionContext {
    /// Create a context with a single role.
    pub fn new(
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        let role = role.into();
        let mut roles = BTreeSet::new();
        roles.insert(role.clone());
        Self {
            subject_id: subject_id.into(),
            tenant_id: tenant_id.into(),
            role,
            roles,
            email: None,
        }
    }

    /// Add a secondary role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Set the email address.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Whether the context holds `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether the context holds any of `roles`.
    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a String>) -> bool {
        roles.into_iter().any(|r| self.roles.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_role_is_in_role_set() {
        let ctx = ExecutionContext::new("u1", "acme", "user").with_role("analyst");
        assert!(ctx.has_role("user"));
        assert!(ctx.has_role("analyst"));
        assert!(!ctx.has_role("admin"));
        assert_eq!(ctx.roles.len(), 2);
    }

    #[test]
    fn test_has_any_role() {
        let ctx = ExecutionContext::new("u1", "acme", "user");
        let elevated = vec!["admin".to_string(), "service_role".to_string()];
        assert!(!ctx.has_any_role(&elevated));
        assert!(ctx.with_role("admin").has_any_role(&elevated));
    }
}
