//! Audit event types.
//!
//! One event is recorded per policy decision and per query lifecycle step.
//! Core fields follow the format `[subject - tenant - role - statement]`.

use chrono::{DateTime, Utc};
use ripple_core::ExecutionContext;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // ===== Policy decisions =====
    /// Row-level security predicates were injected into a statement.
    PolicyApplied,
    /// A statement was rejected (no applicable policy, or missing elevated role).
    AccessDenied,

    // ===== Pull queries =====
    /// Statement executed successfully.
    QueryExecuted,
    /// Statement execution failed.
    QueryFailed,

    // ===== Push queries =====
    /// A continuous query started streaming.
    StreamStarted,
    /// A continuous query was terminated or completed.
    StreamTerminated,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyApplied => write!(f, "POLICY_APPLIED"),
            Self::AccessDenied => write!(f, "ACCESS_DENIED"),
            Self::QueryExecuted => write!(f, "QUERY_EXECUTED"),
            Self::QueryFailed => write!(f, "QUERY_FAILED"),
            Self::StreamStarted => write!(f, "STREAM_STARTED"),
            Self::StreamTerminated => write!(f, "STREAM_TERMINATED"),
        }
    }
}

/// An audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: Uuid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event type.
    pub event_type: AuditEventType,

    // ===== Identity =====
    /// Subject the request ran under.
    pub subject_id: String,

    /// Tenant ID.
    pub tenant_id: String,

    /// Primary role.
    pub role: String,

    // ===== Statement =====
    /// Statement as submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,

    /// Statement after policy predicates were spliced in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_statement: Option<String>,

    /// Predicates injected by the policy engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<String>,

    /// Tables referenced by the statement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,

    // ===== Execution details =====
    /// Backend-assigned query id (push queries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    /// Number of rows returned or streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    /// Duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error or denial reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

impl AuditEvent {
    /// Create a new audit event with the given type and identity fields.
    pub fn new(
        event_type: AuditEventType,
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
            subject_id: subject_id.into(),
            tenant_id: tenant_id.into(),
            role: role.into(),
            statement: None,
            rewritten_statement: None,
            predicates: Vec::new(),
            tables: Vec::new(),
            query_id: None,
            row_count: None,
            duration_ms: None,
            error: None,
            meta: serde_json::Value::Null,
        }
    }

    /// Create a builder for an audit event.
    pub fn builder(
        event_type: AuditEventType,
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        role: impl Into<String>,
    ) -> AuditEventBuilder {
        AuditEventBuilder {
            event: Self::new(event_type, subject_id, tenant_id, role),
        }
    }

    /// Create a builder with identity fields taken from an execution context.
    pub fn for_context(event_type: AuditEventType, ctx: &ExecutionContext) -> AuditEventBuilder {
        Self::builder(event_type, &ctx.subject_id, &ctx.tenant_id, &ctx.role)
    }

    /// Format the event as a human-readable log line.
    ///
    /// Format: `[timestamp] EVENT_TYPE subject=... tenant=... role=... [statement=...]`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {} subject={} tenant={} role={}",
            self.occurred_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.event_type,
            self.subject_id,
            self.tenant_id,
            self.role,
        );

        let shown = self.rewritten_statement.as_ref().or(self.statement.as_ref());
        if let Some(sql) = shown {
            line.push_str(&format!(" statement=\"{}\"", preview(sql, 100).replace('\n', " ")));
        }

        if !self.tables.is_empty() {
            line.push_str(&format!(" tables=[{}]", self.tables.join(",")));
        }

        if !self.predicates.is_empty() {
            line.push_str(&format!(" predicates={}", self.predicates.len()));
        }

        if let Some(ref query_id) = self.query_id {
            line.push_str(&format!(" query_id={}", query_id));
        }

        if let Some(row_count) = self.row_count {
            line.push_str(&format!(" rows={}", row_count));
        }

        if let Some(duration) = self.duration_ms {
            line.push_str(&format!(" duration_ms={}", duration));
        }

        if let Some(ref error) = self.error {
            line.push_str(&format!(" error=\"{}\"", error.replace('"', "'")));
        }

        line
    }
}

/// Truncate on a character boundary.
fn preview(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Builder for creating audit events.
#[derive(Debug)]
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    /// Set the submitted statement.
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.event.statement = Some(sql.into());
        self
    }

    /// Set the rewritten statement.
    pub fn rewritten_statement(mut self, sql: impl Into<String>) -> Self {
        self.event.rewritten_statement = Some(sql.into());
        self
    }

    /// Set the injected predicates.
    pub fn predicates(mut self, predicates: Vec<String>) -> Self {
        self.event.predicates = predicates;
        self
    }

    /// Set the tables referenced.
    pub fn tables(mut self, tables: Vec<String>) -> Self {
        self.event.tables = tables;
        self
    }

    /// Set the backend query id.
    pub fn query_id(mut self, id: impl Into<String>) -> Self {
        self.event.query_id = Some(id.into());
        self
    }

    /// Set the row count.
    pub fn row_count(mut self, count: u64) -> Self {
        self.event.row_count = Some(count);
        self
    }

    /// Set the duration in milliseconds.
    pub fn duration_ms(mut self, duration: u64) -> Self {
        self.event.duration_ms = Some(duration);
        self
    }

    /// Set the error message.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.event.error = Some(error.into());
        self
    }

    /// Set additional metadata.
    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.event.meta = meta;
        self
    }

    /// Build the audit event.
    pub fn build(self) -> AuditEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let ctx = ExecutionContext::new("u1", "acme", "user");
        let event = AuditEvent::for_context(AuditEventType::PolicyApplied, &ctx)
            .statement("SELECT * FROM orders;")
            .rewritten_statement("SELECT * FROM orders WHERE (tenant_id = 'acme');")
            .predicates(vec!["tenant_id = 'acme'".to_string()])
            .tables(vec!["orders".to_string()])
            .build();

        assert_eq!(event.event_type, AuditEventType::PolicyApplied);
        assert_eq!(event.subject_id, "u1");
        assert_eq!(event.tenant_id, "acme");
        assert_eq!(event.role, "user");
        assert_eq!(event.predicates.len(), 1);
    }

    #[test]
    fn test_to_log_line_prefers_rewritten_statement() {
        let event = AuditEvent::builder(AuditEventType::QueryExecuted, "u1", "acme", "user")
            .statement("SELECT * FROM orders;")
            .rewritten_statement("SELECT * FROM orders WHERE (tenant_id = 'acme');")
            .row_count(3)
            .duration_ms(12)
            .build();

        let line = event.to_log_line();
        assert!(line.contains("QUERY_EXECUTED"));
        assert!(line.contains("subject=u1"));
        assert!(line.contains("tenant=acme"));
        assert!(line.contains("tenant_id = 'acme'"));
        assert!(line.contains("rows=3"));
        assert!(line.contains("duration_ms=12"));
    }

    #[test]
    fn test_long_statement_truncated() {
        let sql = format!("SELECT {} FROM t;", "é".repeat(200));
        let event = AuditEvent::builder(AuditEventType::QueryFailed, "u", "t", "r")
            .statement(sql)
            .build();
        assert!(event.to_log_line().contains("...\""));
    }

    #[test]
    fn test_json_shape() {
        let event = AuditEvent::builder(AuditEventType::StreamStarted, "u1", "acme", "user")
            .query_id("q-1")
            .build();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "stream_started");
        assert_eq!(json["query_id"], "q-1");
        assert!(json.get("predicates").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(AuditEventType::PolicyApplied.to_string(), "POLICY_APPLIED");
        assert_eq!(AuditEventType::AccessDenied.to_string(), "ACCESS_DENIED");
        assert_eq!(AuditEventType::StreamTerminated.to_string(), "STREAM_TERMINATED");
    }
}
