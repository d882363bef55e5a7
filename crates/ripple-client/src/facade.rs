//! Statement building, row-level security and execution in one place.

use ripple_audit::{AuditError, AuditLogger};
use ripple_core::{ExecutionContext, PolicyOperation, RippleConfig};
use ripple_query::{
    BuildError, Filter, QueryDescriptor, SqlValue, build_delete, build_insert, build_update,
};
use ripple_rls::PolicyEngine;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::client::QueryClient;
use crate::error::ClientError;
use crate::row::QueryResult;
use crate::stream::{PushCallbacks, StreamAudit, StreamingQueryHandle};

/// Entry point for applications.
///
/// Every operation checks row-level security before anything is sent, so a
/// denied request never reaches the engine.
#[derive(Debug, Clone)]
pub struct Ripple {
    client: QueryClient,
    engine: PolicyEngine,
}

impl Ripple {
    pub fn new(client: QueryClient, engine: PolicyEngine) -> Self {
        Self { client, engine }
    }

    /// Build the client, policy engine and audit logger from configuration.
    pub fn from_config(config: &RippleConfig) -> Result<Self, ClientError> {
        let audit = AuditLogger::new(config.audit.clone())
            .map_err(|e| ClientError::Internal(e.into()))?;
        let engine = PolicyEngine::from_config(&config.rls, audit)?;
        let client = QueryClient::from_config(config)?;
        Ok(Self::new(client, engine))
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    fn audit(&self) -> &AuditLogger {
        self.engine.audit()
    }

    /// Run a descriptor as a pull query.
    pub async fn select(
        &self,
        descriptor: &QueryDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let statement = self
            .authorize(ctx, &descriptor.table, PolicyOperation::Select, &descriptor.filter, |filter| {
                QueryDescriptor {
                    filter: filter.clone(),
                    ..descriptor.clone()
                }
                .build()
            })
            .await?;
        self.run_pull(&statement, ctx).await
    }

    /// Run a descriptor as a push query. `EMIT CHANGES` is added if missing.
    pub async fn stream_select(
        &self,
        descriptor: &QueryDescriptor,
        ctx: &ExecutionContext,
        callbacks: PushCallbacks,
    ) -> Result<StreamingQueryHandle, ClientError> {
        let descriptor = descriptor.clone().emit_changes();
        let statement = self
            .authorize(ctx, &descriptor.table, PolicyOperation::Select, &descriptor.filter, |filter| {
                QueryDescriptor {
                    filter: filter.clone(),
                    ..descriptor.clone()
                }
                .build()
            })
            .await?;
        self.run_stream(&statement, ctx, callbacks).await
    }

    /// Insert one row. RLS is checked but the statement is not rewritten.
    pub async fn insert(
        &self,
        table: &str,
        values: &[(String, SqlValue)],
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let statement = build_insert(table, values)?;
        if let Err(err) = self.engine.scope_for(table, PolicyOperation::Insert, ctx) {
            if err.is_denial() {
                self.engine.record_denial(ctx, &statement, &err).await;
            }
            return Err(err.into());
        }
        self.run_pull(&statement, ctx).await
    }

    /// Update the rows matching `filter`, narrowed by row-level security.
    pub async fn update(
        &self,
        table: &str,
        filter: &Filter,
        values: &[(String, SqlValue)],
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let statement = self
            .authorize(ctx, table, PolicyOperation::Update, filter, |f| {
                build_update(table, f, values)
            })
            .await?;
        self.run_pull(&statement, ctx).await
    }

    /// Delete the rows matching `filter`, narrowed by row-level security.
    pub async fn delete(
        &self,
        table: &str,
        filter: &Filter,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let statement = self
            .authorize(ctx, table, PolicyOperation::Delete, filter, |f| build_delete(table, f))
            .await?;
        self.run_pull(&statement, ctx).await
    }

    /// Run a hand-written statement as a pull query.
    pub async fn execute_statement(
        &self,
        sql: &str,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let outcome = self.engine.apply(sql, ctx).await?;
        self.run_pull(&outcome.rewritten, ctx).await
    }

    /// Run a hand-written statement as a push query.
    pub async fn stream_statement(
        &self,
        sql: &str,
        ctx: &ExecutionContext,
        callbacks: PushCallbacks,
    ) -> Result<StreamingQueryHandle, ClientError> {
        let outcome = self.engine.apply(sql, ctx).await?;
        self.run_stream(&outcome.rewritten, ctx, callbacks).await
    }

    /// Build a statement for `table` with row-level security folded into
    /// its filter.
    async fn authorize<F>(
        &self,
        ctx: &ExecutionContext,
        table: &str,
        operation: PolicyOperation,
        filter: &Filter,
        build: F,
    ) -> Result<String, ClientError>
    where
        F: Fn(&Filter) -> Result<String, BuildError>,
    {
        let original = build(filter)?;

        let scope = match self.engine.scope_for(table, operation, ctx) {
            Ok(scope) => scope,
            Err(err) => {
                if err.is_denial() {
                    self.engine.record_denial(ctx, &original, &err).await;
                }
                return Err(err.into());
            }
        };

        let Some(predicate) = scope.predicate() else {
            return Ok(original);
        };

        let scoped = build(&filter.clone().with_policy_predicate(predicate))?;
        tracing::debug!(
            subject = %ctx.subject_id,
            table,
            predicates = scope.predicates.len(),
            "Row-level security applied"
        );
        warn_on_audit_failure(
            self.audit()
                .log_policy_applied(
                    ctx,
                    &original,
                    &scoped,
                    &scope.predicates,
                    &[table.to_string()],
                )
                .await,
        );
        Ok(scoped)
    }

    async fn run_pull(
        &self,
        statement: &str,
        ctx: &ExecutionContext,
    ) -> Result<QueryResult, ClientError> {
        let start = Instant::now();
        match self.client.pull(statement).await {
            Ok(result) => {
                warn_on_audit_failure(
                    self.audit()
                        .log_query_executed(
                            ctx,
                            statement,
                            result.row_count() as u64,
                            start.elapsed().as_millis() as u64,
                        )
                        .await,
                );
                Ok(result)
            }
            Err(err) => {
                warn_on_audit_failure(
                    self.audit()
                        .log_query_failed(ctx, statement, &err.to_string())
                        .await,
                );
                Err(err)
            }
        }
    }

    async fn run_stream(
        &self,
        statement: &str,
        ctx: &ExecutionContext,
        callbacks: PushCallbacks,
    ) -> Result<StreamingQueryHandle, ClientError> {
        let audit = StreamAudit {
            logger: self.audit().clone(),
            ctx: ctx.clone(),
        };
        let started = self
            .client
            .start_stream(statement, &BTreeMap::new(), callbacks, Some(audit))
            .await;
        if let Err(err) = &started {
            warn_on_audit_failure(
                self.audit()
                    .log_query_failed(ctx, statement, &err.to_string())
                    .await,
            );
        }
        started
    }
}

fn warn_on_audit_failure(result: Result<(), AuditError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to write audit event");
    }
}
