//! [`AuditLogger`]: one helper per policy decision and query lifecycle step,
//! each mirrored to `tracing` before it reaches storage.

use chrono::{DateTime, Utc};
use ripple_core::{AuditConfig, ExecutionContext};
use std::sync::Arc;

use crate::error::AuditError;
use crate::event::{AuditEvent, AuditEventBuilder, AuditEventType};
use crate::storage::{AuditStorage, ConsoleStorage, DualStorage, FileStorage, NullStorage};

/// Records policy decisions and query lifecycle events.
///
/// Cheap to clone; clones share the storage backend.
#[derive(Clone)]
pub struct AuditLogger {
    config: AuditConfig,
    storage: Arc<dyn AuditStorage>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Pick a storage backend from the configuration:
    ///
    /// | enabled | file_path | stdout | storage |
    /// |---------|-----------|--------|---------|
    /// | false   | -         | -      | none    |
    /// | true    | set       | true   | file + console |
    /// | true    | set       | false  | file    |
    /// | true    | unset     | true   | console |
    /// | true    | unset     | false  | tracing only |
    pub fn new(config: AuditConfig) -> Result<Self, AuditError> {
        let storage: Arc<dyn AuditStorage> = if !config.enabled {
            Arc::new(NullStorage::new())
        } else {
            match (&config.file_path, config.stdout) {
                (Some(path), true) => Arc::new(DualStorage::new(path)?),
                (Some(path), false) => Arc::new(FileStorage::new(path)?),
                (None, true) => Arc::new(ConsoleStorage::new()),
                (None, false) => Arc::new(NullStorage::new()),
            }
        };

        Ok(Self { config, storage })
    }

    /// Create a logger with a custom storage backend.
    pub fn with_storage(config: AuditConfig, storage: Arc<dyn AuditStorage>) -> Self {
        Self { config, storage }
    }

    /// Logger that drops every event.
    pub fn disabled() -> Self {
        Self {
            config: AuditConfig {
                enabled: false,
                ..Default::default()
            },
            storage: Arc::new(NullStorage::new()),
        }
    }

    /// Logger that prints every event.
    pub fn console_only() -> Self {
        Self {
            config: AuditConfig {
                enabled: true,
                stdout: true,
                ..Default::default()
            },
            storage: Arc::new(ConsoleStorage::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Log an audit event.
    pub async fn log(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        if !self.config.enabled {
            return Ok(());
        }

        if !self.config.log_statements {
            event.statement = None;
            event.rewritten_statement = None;
        }

        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subject = %event.subject_id,
            tenant = %event.tenant_id,
            role = %event.role,
            "Audit event"
        );

        self.storage.store(event).await
    }

    fn event(&self, event_type: AuditEventType, ctx: &ExecutionContext) -> AuditEventBuilder {
        AuditEvent::for_context(event_type, ctx)
    }

    /// Log a successful policy rewrite.
    pub async fn log_policy_applied(
        &self,
        ctx: &ExecutionContext,
        original: &str,
        rewritten: &str,
        predicates: &[String],
        tables: &[String],
    ) -> Result<(), AuditError> {
        let event = self
            .event(AuditEventType::PolicyApplied, ctx)
            .statement(original)
            .rewritten_statement(rewritten)
            .predicates(predicates.to_vec())
            .tables(tables.to_vec())
            .build();

        self.log(event).await
    }

    /// Log a denied statement.
    pub async fn log_access_denied(
        &self,
        ctx: &ExecutionContext,
        statement: &str,
        tables: &[String],
        reason: &str,
    ) -> Result<(), AuditError> {
        let event = self
            .event(AuditEventType::AccessDenied, ctx)
            .statement(statement)
            .tables(tables.to_vec())
            .error(reason)
            .build();

        self.log(event).await
    }

    /// Log a completed pull query.
    pub async fn log_query_executed(
        &self,
        ctx: &ExecutionContext,
        statement: &str,
        row_count: u64,
        duration_ms: u64,
    ) -> Result<(), AuditError> {
        let event = self
            .event(AuditEventType::QueryExecuted, ctx)
            .statement(statement)
            .row_count(row_count)
            .duration_ms(duration_ms)
            .build();

        self.log(event).await
    }

    /// Log a failed pull query or a push query that failed to start.
    pub async fn log_query_failed(
        &self,
        ctx: &ExecutionContext,
        statement: &str,
        error: &str,
    ) -> Result<(), AuditError> {
        let event = self
            .event(AuditEventType::QueryFailed, ctx)
            .statement(statement)
            .error(error)
            .build();

        self.log(event).await
    }

    /// Log the start of a push query.
    pub async fn log_stream_started(
        &self,
        ctx: &ExecutionContext,
        statement: &str,
        query_id: Option<&str>,
    ) -> Result<(), AuditError> {
        let mut builder = self
            .event(AuditEventType::StreamStarted, ctx)
            .statement(statement);
        if let Some(id) = query_id {
            builder = builder.query_id(id);
        }

        self.log(builder.build()).await
    }

    /// Log the end of a push query.
    pub async fn log_stream_terminated(
        &self,
        ctx: &ExecutionContext,
        query_id: Option<&str>,
        row_count: u64,
        duration_ms: u64,
    ) -> Result<(), AuditError> {
        let mut builder = self
            .event(AuditEventType::StreamTerminated, ctx)
            .row_count(row_count)
            .duration_ms(duration_ms);
        if let Some(id) = query_id {
            builder = builder.query_id(id);
        }

        self.log(builder.build()).await
    }

    /// Stored events matching `filter`.
    pub async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        self.storage.query(filter).await
    }

    /// Number of stored events matching `filter`, ignoring its limit and offset.
    pub async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        self.storage.count(filter).await
    }

    pub async fn get(&self, event_id: uuid::Uuid) -> Result<Option<AuditEvent>, AuditError> {
        self.storage.get(event_id).await
    }

    /// Get recent events for a tenant, newest first.
    pub async fn recent_for_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        self.query(AuditFilter {
            tenant_id: Some(tenant_id.to_string()),
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }
}

/// Criteria for reading events back. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by subject.
    pub subject_id: Option<String>,
    /// Filter by tenant ID.
    pub tenant_id: Option<String>,
    /// Filter by role.
    pub role: Option<String>,
    /// Filter by event type.
    pub event_type: Option<AuditEventType>,
    /// Filter by referenced table.
    pub table: Option<String>,
    /// Filter by start time (inclusive).
    pub start_time: Option<DateTime<Utc>>,
    /// Filter by end time (inclusive).
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
    /// Sort oldest first. Newest first by default.
    pub ascending: bool,
}

impl AuditFilter {
    /// Whether `event` passes every set criterion.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }

        eq(&self.subject_id, &event.subject_id)
            && eq(&self.tenant_id, &event.tenant_id)
            && eq(&self.role, &event.role)
            && self.event_type.is_none_or(|t| t == event.event_type)
            && self
                .table
                .as_ref()
                .is_none_or(|t| event.tables.iter().any(|e| e == t))
            && self.start_time.is_none_or(|s| event.occurred_at >= s)
            && self.end_time.is_none_or(|e| event.occurred_at <= e)
    }

    /// Filter, sort and page a set of events.
    pub fn apply(&self, events: impl IntoIterator<Item = AuditEvent>) -> Vec<AuditEvent> {
        let mut results: Vec<_> = events.into_iter().filter(|e| self.matches(e)).collect();

        results.sort_by_key(|e| e.occurred_at);
        if !self.ascending {
            results.reverse();
        }

        results
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
