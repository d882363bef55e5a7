//! The policy engine: registry plus statement rewriting.

use anyhow::anyhow;
use ripple_audit::AuditLogger;
use ripple_core::{ExecutionContext, PolicyDefinition, PolicyOperation, RlsConfig};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::RlsError;
use crate::injector::{combine_predicates, qualify_columns, splice_predicate};
use crate::parser::{StatementAnalyzer, StatementKind};
use crate::policy::{Policy, unqualified};

#[derive(Debug, Default)]
struct Registry {
    policies: Vec<Policy>,
    /// Lowercased names of RLS-enabled tables.
    enabled_tables: BTreeSet<String>,
    elevated_roles: Vec<String>,
}

impl Registry {
    fn is_enabled(&self, table: &str) -> bool {
        let full = table.to_ascii_lowercase();
        self.enabled_tables.contains(&full)
            || self
                .enabled_tables
                .contains(&unqualified(table).to_ascii_lowercase())
    }

    /// Rendered predicates for one table, or `AccessDenied` when no policy
    /// applies. `None` means the table is not RLS-enabled.
    fn predicates_for(
        &self,
        table: &str,
        operation: PolicyOperation,
        ctx: &ExecutionContext,
    ) -> Result<Option<Vec<String>>, RlsError> {
        if !self.is_enabled(table) {
            return Ok(None);
        }

        let matching: Vec<&Policy> = self
            .policies
            .iter()
            .filter(|p| p.applies(table, operation, ctx))
            .collect();

        if matching.is_empty() {
            return Err(RlsError::AccessDenied {
                table: table.to_string(),
                operation: operation.to_string(),
                role: ctx.role.clone(),
            });
        }

        Ok(Some(matching.iter().filter_map(|p| p.render(ctx)).collect()))
    }
}

/// Outcome of checking and rewriting one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewriteOutcome {
    /// Statement as submitted.
    pub original: String,
    /// Statement to send to the backend.
    pub rewritten: String,
    pub kind: StatementKind,
    /// RLS-enabled tables the statement touches.
    pub tables: Vec<String>,
    /// Predicates injected, in policy order.
    pub predicates: Vec<String>,
}

impl RewriteOutcome {
    fn unchanged(sql: &str, kind: StatementKind) -> Self {
        Self {
            original: sql.to_string(),
            rewritten: sql.to_string(),
            kind,
            tables: Vec::new(),
            predicates: Vec::new(),
        }
    }

    /// Whether predicates were spliced into the statement.
    pub fn is_rewritten(&self) -> bool {
        self.original != self.rewritten
    }
}

/// Row-level security for one table, as needed by descriptor-built statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableScope {
    /// Whether the table is RLS-enabled.
    pub enforced: bool,
    /// Predicates to inject; empty when every matching policy is trivial.
    pub predicates: Vec<String>,
}

impl TableScope {
    /// Combined predicate, if any. A single predicate is returned as is.
    pub fn predicate(&self) -> Option<String> {
        match self.predicates.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            many => Some(combine_predicates(many)),
        }
    }
}

/// Holds access policies and rewrites statements under an execution context.
///
/// Cheap to clone; clones share one registry.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    registry: Arc<RwLock<Registry>>,
    analyzer: StatementAnalyzer,
    audit: AuditLogger,
}

impl PolicyEngine {
    /// Create an empty engine. Elevated roles default to `admin` and `service_role`.
    pub fn new(audit: AuditLogger) -> Self {
        let registry = Registry {
            elevated_roles: RlsConfig::default().elevated_roles,
            ..Default::default()
        };
        Self {
            registry: Arc::new(RwLock::new(registry)),
            analyzer: StatementAnalyzer::new(),
            audit,
        }
    }

    /// Create an engine loaded from configuration.
    pub fn from_config(config: &RlsConfig, audit: AuditLogger) -> Result<Self, RlsError> {
        let engine = Self::new(audit);
        {
            let mut registry = engine.write()?;
            registry.elevated_roles = config.elevated_roles.clone();
            registry.enabled_tables = config
                .enabled_tables
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect();
        }
        for definition in &config.policies {
            engine.add_policy(definition.clone())?;
        }
        tracing::info!(
            policies = config.policies.len(),
            tables = config.enabled_tables.len(),
            "Policy engine loaded"
        );
        Ok(engine)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>, RlsError> {
        self.registry
            .read()
            .map_err(|e| RlsError::Internal(anyhow!("policy registry lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>, RlsError> {
        self.registry
            .write()
            .map_err(|e| RlsError::Internal(anyhow!("policy registry lock poisoned: {e}")))
    }

    /// The audit logger events are written to.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Register a policy. Ids must be unique.
    pub fn add_policy(&self, definition: PolicyDefinition) -> Result<(), RlsError> {
        let policy = Policy::compile(definition)?;
        let mut registry = self.write()?;
        if registry.policies.iter().any(|p| p.id() == policy.id()) {
            return Err(RlsError::DuplicatePolicy(policy.id().to_string()));
        }
        tracing::debug!(policy = policy.id(), table = %policy.definition().table, "Policy added");
        registry.policies.push(policy);
        Ok(())
    }

    /// Remove a policy. Returns whether it existed.
    pub fn remove_policy(&self, id: &str) -> Result<bool, RlsError> {
        let mut registry = self.write()?;
        let before = registry.policies.len();
        registry.policies.retain(|p| p.id() != id);
        Ok(registry.policies.len() != before)
    }

    /// Enable or disable a policy. Returns whether it exists.
    pub fn set_policy_enabled(&self, id: &str, enabled: bool) -> Result<bool, RlsError> {
        let mut registry = self.write()?;
        match registry.policies.iter_mut().find(|p| p.id() == id) {
            Some(policy) => {
                policy.set_enabled(enabled);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Enabled policies whose pattern matches `table`.
    pub fn policies_for(&self, table: &str) -> Result<Vec<PolicyDefinition>, RlsError> {
        Ok(self
            .read()?
            .policies
            .iter()
            .filter(|p| p.targets(table))
            .map(|p| p.definition().clone())
            .collect())
    }

    /// Enforce row-level security on `table`.
    pub fn enable_rls(&self, table: &str) -> Result<(), RlsError> {
        self.write()?.enabled_tables.insert(table.to_ascii_lowercase());
        Ok(())
    }

    /// Stop enforcing row-level security on `table`.
    pub fn disable_rls(&self, table: &str) -> Result<(), RlsError> {
        self.write()?.enabled_tables.remove(&table.to_ascii_lowercase());
        Ok(())
    }

    pub fn is_rls_enabled(&self, table: &str) -> Result<bool, RlsError> {
        Ok(self.read()?.is_enabled(table))
    }

    /// Predicates for a single table and operation.
    pub fn scope_for(
        &self,
        table: &str,
        operation: PolicyOperation,
        ctx: &ExecutionContext,
    ) -> Result<TableScope, RlsError> {
        match self.read()?.predicates_for(table, operation, ctx)? {
            Some(predicates) => Ok(TableScope {
                enforced: true,
                predicates,
            }),
            None => Ok(TableScope::default()),
        }
    }

    /// Check and rewrite a statement without writing audit events.
    pub fn explain(&self, sql: &str, ctx: &ExecutionContext) -> Result<RewriteOutcome, RlsError> {
        let analysis = self.analyzer.analyze(sql);
        let kind = analysis.kind;

        if analysis.multiple_statements {
            return Err(RlsError::UnscopableStatement {
                reason: "multiple statements in one request".to_string(),
            });
        }

        let registry = self.read()?;

        if kind.is_privileged() {
            if !ctx.has_any_role(&registry.elevated_roles) {
                return Err(RlsError::PrivilegedOperation {
                    operation: kind.to_string(),
                    role: ctx.role.clone(),
                });
            }
            return Ok(RewriteOutcome::unchanged(sql, kind));
        }

        let Some(operation) = kind.policy_operation() else {
            return Ok(RewriteOutcome::unchanged(sql, kind));
        };

        // With several relations in scope a bare column may be ambiguous.
        let qualify_by_name = analysis.outer_relations > 1;

        let mut tables = Vec::new();
        let mut predicates = Vec::new();
        for table in &analysis.tables {
            let Some(rendered) = registry.predicates_for(&table.name, operation, ctx)? else {
                continue;
            };
            // Only the outermost WHERE is rewritten, so a filtered table
            // read anywhere deeper would escape its policy.
            if table.nested && !rendered.is_empty() {
                return Err(RlsError::UnscopableStatement {
                    reason: format!(
                        "table '{}' is referenced below the outermost FROM clause",
                        table.name
                    ),
                });
            }
            tables.push(table.name.clone());
            let qualifier = table
                .alias
                .as_deref()
                .or_else(|| qualify_by_name.then_some(table.name.as_str()));
            predicates.extend(rendered.into_iter().map(|p| match qualifier {
                Some(q) => qualify_columns(&p, q),
                None => p,
            }));
        }
        drop(registry);

        let mut outcome = RewriteOutcome {
            tables,
            ..RewriteOutcome::unchanged(sql, kind)
        };

        // INSERT has no filter to narrow; the policy lookup above still gates it.
        if kind == StatementKind::Insert || predicates.is_empty() {
            return Ok(outcome);
        }

        if analysis.set_operation {
            return Err(RlsError::UnscopableStatement {
                reason: "set operations over RLS-enabled tables are not rewritten".to_string(),
            });
        }

        outcome.rewritten = splice_predicate(sql, &combine_predicates(&predicates));
        outcome.predicates = predicates;
        Ok(outcome)
    }

    /// Check and rewrite a statement, recording the decision in the audit log.
    pub async fn apply(&self, sql: &str, ctx: &ExecutionContext) -> Result<RewriteOutcome, RlsError> {
        match self.explain(sql, ctx) {
            Ok(outcome) => {
                if outcome.is_rewritten() {
                    tracing::debug!(
                        subject = %ctx.subject_id,
                        tables = ?outcome.tables,
                        predicates = outcome.predicates.len(),
                        "Row-level security applied"
                    );
                    if let Err(e) = self
                        .audit
                        .log_policy_applied(
                            ctx,
                            &outcome.original,
                            &outcome.rewritten,
                            &outcome.predicates,
                            &outcome.tables,
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to write audit event");
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                if err.is_denial() {
                    self.record_denial(ctx, sql, &err).await;
                }
                Err(err)
            }
        }
    }

    /// Log and audit a denial.
    pub async fn record_denial(&self, ctx: &ExecutionContext, sql: &str, err: &RlsError) {
        let tables = match err {
            RlsError::AccessDenied { table, .. } => vec![table.clone()],
            _ => Vec::new(),
        };
        tracing::warn!(
            subject = %ctx.subject_id,
            tenant = %ctx.tenant_id,
            role = %ctx.role,
            error = %err,
            "Statement denied"
        );
        if let Err(e) = self
            .audit
            .log_access_denied(ctx, sql, &tables, &err.to_string())
            .await
        {
            tracing::warn!(error = %e, "Failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ripple_audit::{AuditEventType, MemoryStorage};
    use ripple_core::AuditConfig;

    fn policy(id: &str, table: &str, op: PolicyOperation, roles: &[&str], cond: &str) -> PolicyDefinition {
        PolicyDefinition {
            id: id.to_string(),
            table: table.to_string(),
            operation: op,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            condition: cond.to_string(),
            enabled: true,
        }
    }

    fn engine() -> PolicyEngine {
        let config = RlsConfig {
            enabled_tables: vec!["orders".to_string(), "payments".to_string()],
            policies: vec![
                policy("tenant", "*", PolicyOperation::All, &["user"], "tenantId = auth.tenant_id()"),
                policy("role", "orders", PolicyOperation::Select, &["user"], "role = auth.role()"),
            ],
            ..Default::default()
        };
        PolicyEngine::from_config(&config, AuditLogger::disabled()).unwrap()
    }

    fn user() -> ExecutionContext {
        ExecutionContext::new("u1", "A", "user")
    }

    #[test]
    fn test_predicates_and_joined() {
        let outcome = engine().explain("SELECT * FROM orders;", &user()).unwrap();
        assert_eq!(
            outcome.rewritten,
            "SELECT * FROM orders WHERE (tenantId = 'A') AND (role = 'user');"
        );
        assert!(!outcome.rewritten.contains(" OR "));
        assert_eq!(outcome.predicates, vec!["tenantId = 'A'", "role = 'user'"]);
        assert_eq!(outcome.tables, vec!["orders"]);
    }

    #[test]
    fn test_existing_where_parenthesised() {
        let outcome = engine()
            .explain("SELECT * FROM payments WHERE a = 1 OR b = 2 LIMIT 3;", &user())
            .unwrap();
        assert_eq!(
            outcome.rewritten,
            "SELECT * FROM payments WHERE (a = 1 OR b = 2) AND (tenantId = 'A') LIMIT 3;"
        );
    }

    #[test]
    fn test_zero_matching_policies_denied() {
        let engine = engine();
        engine.enable_rls("invoices").unwrap();
        engine.remove_policy("tenant").unwrap();

        let err = engine.explain("SELECT * FROM invoices", &user()).unwrap_err();
        assert!(matches!(err, RlsError::AccessDenied { ref table, .. } if table == "invoices"));

        // Wrong role also denies.
        let guest = ExecutionContext::new("g", "A", "guest");
        assert!(matches!(
            engine.explain("SELECT * FROM orders", &guest),
            Err(RlsError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_tables_without_rls_pass_through() {
        let outcome = engine().explain("SELECT * FROM products", &user()).unwrap();
        assert!(!outcome.is_rewritten());
        assert!(outcome.tables.is_empty());
    }

    #[test]
    fn test_ddl_requires_elevated_role() {
        let engine = engine();
        let err = engine.explain("DROP TABLE orders;", &user()).unwrap_err();
        assert!(matches!(err, RlsError::PrivilegedOperation { .. }));
        assert!(matches!(
            engine.explain("CREATE STREAM s (id INT) WITH (kafka_topic='s');", &user()),
            Err(RlsError::PrivilegedOperation { .. })
        ));

        let admin = ExecutionContext::new("root", "A", "user").with_role("admin");
        let outcome = engine.explain("DROP TABLE orders;", &admin).unwrap();
        assert!(!outcome.is_rewritten());
    }

    #[test]
    fn test_show_statements_pass_through() {
        let outcome = engine().explain("SHOW STREAMS;", &user()).unwrap();
        assert_eq!(outcome.kind, StatementKind::Other);
        assert_eq!(outcome.rewritten, "SHOW STREAMS;");
    }

    #[test]
    fn test_insert_checked_not_rewritten() {
        let engine = engine();
        let outcome = engine
            .explain("INSERT INTO orders (id) VALUES (1);", &user())
            .unwrap();
        assert!(!outcome.is_rewritten());
        assert_eq!(outcome.tables, vec!["orders"]);

        let guest = ExecutionContext::new("g", "A", "guest");
        assert!(engine
            .explain("INSERT INTO orders (id) VALUES (1);", &guest)
            .is_err());
    }

    #[test]
    fn test_alias_qualifies_predicates() {
        let outcome = engine()
            .explain(
                "SELECT o.id FROM orders o JOIN payments p ON o.id = p.order_id WHERE o.total > 5",
                &user(),
            )
            .unwrap();
        assert_eq!(
            outcome.rewritten,
            "SELECT o.id FROM orders o JOIN payments p ON o.id = p.order_id \
             WHERE (o.total > 5) AND (o.tenantId = 'A') AND (o.role = 'user') AND (p.tenantId = 'A')"
        );
    }

    #[test]
    fn test_unaliased_join_qualified_by_table_name() {
        let outcome = engine()
            .explain(
                "SELECT * FROM orders JOIN payments ON orders.id = payments.order_id",
                &user(),
            )
            .unwrap();
        assert_eq!(
            outcome.rewritten,
            "SELECT * FROM orders JOIN payments ON orders.id = payments.order_id \
             WHERE (orders.tenantId = 'A') AND (orders.role = 'user') AND (payments.tenantId = 'A')"
        );
        assert_eq!(outcome.tables, vec!["orders", "payments"]);
    }

    #[test]
    fn test_join_with_unfiltered_table_qualifies_rls_table() {
        let outcome = engine()
            .explain(
                "SELECT * FROM products JOIN payments ON products.id = payments.product_id",
                &user(),
            )
            .unwrap();
        assert!(outcome.rewritten.ends_with("WHERE (payments.tenantId = 'A')"));
    }

    #[test]
    fn test_rls_table_in_subquery_rejected() {
        let engine = engine();
        for sql in [
            "SELECT * FROM products WHERE id IN (SELECT product_id FROM payments)",
            "SELECT * FROM products WHERE EXISTS (SELECT 1 FROM orders o WHERE o.pid = products.id)",
            "SELECT t.id FROM (SELECT id FROM payments) AS t",
            "SELECT * FROM orders WHERE id IN (SELECT id FROM orders WHERE total > 5)",
            "DELETE FROM products WHERE id IN (SELECT product_id FROM payments)",
        ] {
            let err = engine.explain(sql, &user()).unwrap_err();
            assert!(
                matches!(err, RlsError::UnscopableStatement { ref reason } if reason.contains("below the outermost")),
                "{sql}: {err}"
            );
        }
    }

    #[test]
    fn test_rls_table_in_cte_rejected() {
        let err = engine()
            .explain(
                "WITH x AS (SELECT id, total FROM payments) SELECT * FROM x",
                &user(),
            )
            .unwrap_err();
        assert!(matches!(err, RlsError::UnscopableStatement { .. }));
    }

    #[test]
    fn test_unfiltered_tables_in_subqueries_allowed() {
        let engine = engine();
        let outcome = engine
            .explain(
                "SELECT * FROM orders WHERE product_id IN (SELECT id FROM products)",
                &user(),
            )
            .unwrap();
        assert_eq!(
            outcome.rewritten,
            "SELECT * FROM orders WHERE (product_id IN (SELECT id FROM products)) \
             AND (tenantId = 'A') AND (role = 'user')"
        );

        // A trivial policy has nothing to inject, so nesting is harmless.
        engine
            .add_policy(policy("open", "payments", PolicyOperation::Select, &["analyst"], "1 = 1"))
            .unwrap();
        let analyst = ExecutionContext::new("a", "A", "analyst");
        let outcome = engine
            .explain("WITH x AS (SELECT * FROM payments) SELECT * FROM x", &analyst)
            .unwrap();
        assert!(!outcome.is_rewritten());
    }

    #[test]
    fn test_set_operation_rejected() {
        let err = engine()
            .explain("SELECT id FROM orders UNION SELECT id FROM products", &user())
            .unwrap_err();
        assert!(matches!(err, RlsError::UnscopableStatement { .. }));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let err = engine()
            .explain("SELECT * FROM products; DROP TABLE orders;", &user())
            .unwrap_err();
        assert!(matches!(err, RlsError::UnscopableStatement { .. }));
    }

    #[test]
    fn test_trivial_policy_allows_without_predicate() {
        let engine = engine();
        engine
            .add_policy(policy("open", "payments", PolicyOperation::Select, &["analyst"], "1 = 1"))
            .unwrap();
        let analyst = ExecutionContext::new("a", "A", "analyst");
        let outcome = engine.explain("SELECT * FROM payments", &analyst).unwrap();
        assert!(!outcome.is_rewritten());
        assert_eq!(outcome.tables, vec!["payments"]);
    }

    #[test]
    fn test_registry_management() {
        let engine = engine();
        assert!(matches!(
            engine.add_policy(policy("tenant", "x", PolicyOperation::All, &["u"], "true")),
            Err(RlsError::DuplicatePolicy(_))
        ));
        assert_eq!(engine.policies_for("orders").unwrap().len(), 2);
        assert_eq!(engine.policies_for("payments").unwrap().len(), 1);

        assert!(engine.set_policy_enabled("role", false).unwrap());
        assert_eq!(engine.policies_for("orders").unwrap().len(), 1);

        engine.disable_rls("orders").unwrap();
        assert!(!engine.is_rls_enabled("orders").unwrap());
        assert!(engine.is_rls_enabled("public.payments").unwrap());
        assert!(!engine.remove_policy("missing").unwrap());
    }

    #[test]
    fn test_scope_for_single_table() {
        let scope = engine()
            .scope_for("orders", PolicyOperation::Select, &user())
            .unwrap();
        assert!(scope.enforced);
        assert_eq!(
            scope.predicate().as_deref(),
            Some("(tenantId = 'A') AND (role = 'user')")
        );

        let open = engine()
            .scope_for("products", PolicyOperation::Select, &user())
            .unwrap();
        assert_eq!(open, TableScope::default());
        assert_eq!(open.predicate(), None);
    }

    #[tokio::test]
    async fn test_apply_audits_decisions() {
        let storage = Arc::new(MemoryStorage::new());
        let audit = AuditLogger::with_storage(AuditConfig::default(), storage.clone());
        let config = RlsConfig {
            enabled_tables: vec!["orders".to_string()],
            policies: vec![policy(
                "tenant",
                "orders",
                PolicyOperation::All,
                &["user"],
                "tenant_id = auth.tenant_id()",
            )],
            ..Default::default()
        };
        let engine = PolicyEngine::from_config(&config, audit).unwrap();

        engine.apply("SELECT * FROM orders", &user()).await.unwrap();
        let guest = ExecutionContext::new("g", "A", "guest");
        assert!(engine.apply("SELECT * FROM orders", &guest).await.is_err());

        let events = storage.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::PolicyApplied);
        assert_eq!(events[0].predicates, vec!["tenant_id = 'A'"]);
        assert_eq!(events[1].event_type, AuditEventType::AccessDenied);
        assert_eq!(events[1].subject_id, "g");
    }
}
