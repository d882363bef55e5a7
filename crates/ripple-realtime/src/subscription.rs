//! Subscription descriptors and event matching.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Ordering;

use crate::error::RealtimeError;
use crate::event::{ChangeKind, RealtimeEvent};
use crate::frame::PRESENCE_CHANGE_EVENT;

/// Which table changes a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFilter {
    #[default]
    #[serde(rename = "*")]
    All,
    Insert,
    Update,
    Delete,
}

impl ChangeFilter {
    pub fn accepts(&self, change: ChangeKind) -> bool {
        matches!(
            (self, change),
            (ChangeFilter::All, _)
                | (ChangeFilter::Insert, ChangeKind::Insert)
                | (ChangeFilter::Update, ChangeKind::Update)
                | (ChangeFilter::Delete, ChangeKind::Delete)
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            ChangeFilter::All => "*",
            ChangeFilter::Insert => "insert",
            ChangeFilter::Update => "update",
            ChangeFilter::Delete => "delete",
        }
    }
}

impl From<ChangeKind> for ChangeFilter {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => ChangeFilter::Insert,
            ChangeKind::Update => ChangeFilter::Update,
            ChangeKind::Delete => ChangeFilter::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            _ => return None,
        })
    }
}

/// A `column=op.value` row filter, e.g. `status=eq.open` or `id=in.(1,2,3)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
    raw: String,
}

impl ColumnFilter {
    pub fn parse(raw: &str) -> Result<Self, RealtimeError> {
        let invalid = |reason: &str| RealtimeError::InvalidFilter {
            filter: raw.to_string(),
            reason: reason.to_string(),
        };

        let (column, rest) = raw.split_once('=').ok_or_else(|| invalid("expected column=op.value"))?;
        let (op, value) = rest.split_once('.').ok_or_else(|| invalid("expected op.value"))?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid("empty column"));
        }
        let op = FilterOp::parse(op.trim()).ok_or_else(|| invalid("unknown operator"))?;

        Ok(Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, record: &Value) -> bool {
        let Some(actual) = record.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => equals(actual, &self.value),
            FilterOp::Neq => !equals(actual, &self.value),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .any(|candidate| equals(actual, candidate.trim())),
        }
    }
}

fn equals(actual: &Value, expected: &str) -> bool {
    match actual {
        Value::String(s) => s == expected,
        Value::Null => expected.eq_ignore_ascii_case("null"),
        Value::Bool(b) => expected.parse::<bool>().is_ok_and(|e| e == *b),
        Value::Number(n) => match (n.as_f64(), expected.parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => n.to_string() == expected,
        },
        other => other.to_string() == expected,
    }
}

fn compare(actual: &Value, expected: &str) -> Option<Ordering> {
    match actual {
        Value::Number(n) => n.as_f64()?.partial_cmp(&expected.parse::<f64>().ok()?),
        Value::String(s) => Some(s.as_str().cmp(expected)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind {
    TableChanges {
        table: String,
        change: ChangeFilter,
        filter: Option<ColumnFilter>,
    },
    Stream { stream: String },
    /// `"*"` receives every broadcast event.
    Broadcast { event: String },
    Presence,
}

impl SubscriptionKind {
    /// Event name used in subscribe and unsubscribe frames.
    pub fn event_name(&self) -> &'static str {
        match self {
            SubscriptionKind::TableChanges { .. } => "table_changes",
            SubscriptionKind::Stream { .. } => "stream",
            SubscriptionKind::Broadcast { .. } => "broadcast",
            SubscriptionKind::Presence => PRESENCE_CHANGE_EVENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub kind: SubscriptionKind,
}

impl Subscription {
    pub fn new(id: impl Into<String>, kind: SubscriptionKind) -> Self {
        Self { id: id.into(), kind }
    }

    /// Payload of the subscribe frame announcing this subscription.
    pub fn to_payload(&self) -> Value {
        match &self.kind {
            SubscriptionKind::TableChanges {
                table,
                change,
                filter,
            } => {
                let mut payload = json!({"id": self.id, "table": table, "change": change.as_str()});
                if let Some(filter) = filter {
                    payload["filter"] = Value::String(filter.as_str().to_string());
                }
                payload
            }
            SubscriptionKind::Stream { stream } => json!({"id": self.id, "stream": stream}),
            SubscriptionKind::Broadcast { event } => json!({"id": self.id, "event": event}),
            SubscriptionKind::Presence => json!({"id": self.id}),
        }
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        match (&self.kind, event) {
            (
                SubscriptionKind::TableChanges {
                    table,
                    change,
                    filter,
                },
                RealtimeEvent::TableChange {
                    table: event_table,
                    change: event_change,
                    record,
                    old_record,
                },
            ) => {
                if !same_table(table, event_table) || !change.accepts(*event_change) {
                    return false;
                }
                let Some(filter) = filter else {
                    return true;
                };
                // Deletes carry the removed row in `old_record`.
                let row = match (event_change, old_record) {
                    (ChangeKind::Delete, Some(old)) if record.is_null() => old,
                    _ => record,
                };
                filter.matches(row)
            }
            (SubscriptionKind::Stream { stream }, RealtimeEvent::Stream { stream: name, .. }) => {
                stream == name
            }
            (SubscriptionKind::Broadcast { event }, RealtimeEvent::Broadcast { event: name, .. }) => {
                event == "*" || event == name
            }
            (SubscriptionKind::Presence, RealtimeEvent::Presence { .. }) => true,
            _ => false,
        }
    }
}

/// `public.orders` matches a subscription on `orders` and vice versa.
fn same_table(subscribed: &str, incoming: &str) -> bool {
    let unqualified = |name: &str| name.rsplit('.').next().unwrap_or(name).to_ascii_lowercase();
    subscribed.eq_ignore_ascii_case(incoming) || unqualified(subscribed) == unqualified(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change(table: &str, change: ChangeKind, record: Value) -> RealtimeEvent {
        RealtimeEvent::TableChange {
            table: table.to_string(),
            change,
            record,
            old_record: None,
        }
    }

    #[test]
    fn test_column_filter_parse() {
        let filter = ColumnFilter::parse("status=eq.open").unwrap();
        assert_eq!(filter.column, "status");
        assert_eq!(filter.op, FilterOp::Eq);
        assert_eq!(filter.value, "open");

        // Only the first dot separates operator and value.
        assert_eq!(ColumnFilter::parse("price=gt.1.5").unwrap().value, "1.5");

        assert!(ColumnFilter::parse("status").is_err());
        assert!(ColumnFilter::parse("status=open").is_err());
        assert!(ColumnFilter::parse("status=like.o%").is_err());
        assert!(ColumnFilter::parse("=eq.1").is_err());
    }

    #[test]
    fn test_column_filter_matching() {
        let record = json!({"id": 7, "status": "open", "paid": false, "note": null});
        assert!(ColumnFilter::parse("id=eq.7").unwrap().matches(&record));
        assert!(ColumnFilter::parse("id=eq.7.0").unwrap().matches(&record));
        assert!(ColumnFilter::parse("id=gte.7").unwrap().matches(&record));
        assert!(!ColumnFilter::parse("id=lt.7").unwrap().matches(&record));
        assert!(ColumnFilter::parse("status=neq.closed").unwrap().matches(&record));
        assert!(ColumnFilter::parse("status=in.(new, open)").unwrap().matches(&record));
        assert!(ColumnFilter::parse("paid=eq.false").unwrap().matches(&record));
        assert!(ColumnFilter::parse("note=eq.null").unwrap().matches(&record));
        assert!(!ColumnFilter::parse("missing=eq.1").unwrap().matches(&record));
    }

    #[test]
    fn test_table_change_matching() {
        let sub = Subscription::new(
            "sub-1",
            SubscriptionKind::TableChanges {
                table: "orders".into(),
                change: ChangeFilter::Insert,
                filter: Some(ColumnFilter::parse("status=eq.open").unwrap()),
            },
        );

        assert!(sub.matches(&change("public.orders", ChangeKind::Insert, json!({"status": "open"}))));
        assert!(!sub.matches(&change("orders", ChangeKind::Update, json!({"status": "open"}))));
        assert!(!sub.matches(&change("orders", ChangeKind::Insert, json!({"status": "paid"}))));
        assert!(!sub.matches(&change("invoices", ChangeKind::Insert, json!({"status": "open"}))));
    }

    #[test]
    fn test_delete_filters_on_old_record() {
        let sub = Subscription::new(
            "sub-1",
            SubscriptionKind::TableChanges {
                table: "orders".into(),
                change: ChangeFilter::All,
                filter: Some(ColumnFilter::parse("id=eq.3").unwrap()),
            },
        );
        let deleted = RealtimeEvent::TableChange {
            table: "orders".into(),
            change: ChangeKind::Delete,
            record: Value::Null,
            old_record: Some(json!({"id": 3})),
        };
        assert!(sub.matches(&deleted));
    }

    #[test]
    fn test_payloads() {
        let sub = Subscription::new(
            "sub-2",
            SubscriptionKind::TableChanges {
                table: "orders".into(),
                change: ChangeFilter::All,
                filter: Some(ColumnFilter::parse("id=eq.3").unwrap()),
            },
        );
        assert_eq!(
            sub.to_payload(),
            json!({"id": "sub-2", "table": "orders", "change": "*", "filter": "id=eq.3"})
        );
        assert_eq!(sub.kind.event_name(), "table_changes");

        let presence = Subscription::new("sub-3", SubscriptionKind::Presence);
        assert_eq!(presence.kind.event_name(), PRESENCE_CHANGE_EVENT);
        assert_eq!(presence.to_payload(), json!({"id": "sub-3"}));
    }

    #[test]
    fn test_broadcast_wildcard() {
        let all = Subscription::new("a", SubscriptionKind::Broadcast { event: "*".into() });
        let cursor = Subscription::new("b", SubscriptionKind::Broadcast { event: "cursor".into() });
        let event = RealtimeEvent::Broadcast {
            event: "typing".into(),
            payload: json!({}),
        };
        assert!(all.matches(&event));
        assert!(!cursor.matches(&event));
    }
}
