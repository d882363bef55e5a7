//! Typed events decoded from incoming frames, and channel lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::frame::{Frame, FrameType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "insert" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// An event received on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// A row was inserted, updated or deleted.
    TableChange {
        table: String,
        change: ChangeKind,
        record: Value,
        old_record: Option<Value>,
    },
    /// A message emitted by a named stream.
    Stream { stream: String, data: Value },
    Broadcast { event: String, payload: Value },
    Presence { event: String, state: Value },
    /// Server acknowledgement of a frame the client sent.
    Reply {
        reference: Option<String>,
        status: String,
        response: Value,
    },
    Error { message: String },
}

impl RealtimeEvent {
    /// Decode a frame. Heartbeats, echoed control frames and unknown types
    /// yield `None`.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let payload = &frame.payload;
        match frame.frame_type {
            FrameType::Event => {
                if let Some(change) = ChangeKind::parse(&frame.event) {
                    let table = string_field(payload, "table")?;
                    return Some(RealtimeEvent::TableChange {
                        table,
                        change,
                        record: payload.get("record").cloned().unwrap_or(Value::Null),
                        old_record: payload
                            .get("old_record")
                            .filter(|v| !v.is_null())
                            .cloned(),
                    });
                }
                if frame.event == "stream" {
                    return Some(RealtimeEvent::Stream {
                        stream: string_field(payload, "stream")?,
                        data: payload.get("data").cloned().unwrap_or(Value::Null),
                    });
                }
                None
            }
            FrameType::Broadcast => Some(RealtimeEvent::Broadcast {
                event: frame.event.clone(),
                payload: payload.clone(),
            }),
            FrameType::Presence => Some(RealtimeEvent::Presence {
                event: frame.event.clone(),
                state: payload.clone(),
            }),
            FrameType::Reply => Some(RealtimeEvent::Reply {
                reference: frame.reference.clone(),
                status: string_field(payload, "status").unwrap_or_else(|| "ok".to_string()),
                response: payload.get("response").cloned().unwrap_or(Value::Null),
            }),
            FrameType::Error => Some(RealtimeEvent::Error {
                message: string_field(payload, "message")
                    .unwrap_or_else(|| payload.to_string()),
            }),
            _ => None,
        }
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Connection lifecycle of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    /// `terminal` is set once reconnecting has given up.
    Error { message: String, terminal: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(frame_type: FrameType, event: &str, payload: Value) -> Frame {
        Frame::new("orders", "1", frame_type, event, payload)
    }

    #[test]
    fn test_table_change_decoding() {
        let event = RealtimeEvent::from_frame(&frame(
            FrameType::Event,
            "UPDATE",
            json!({"table": "orders", "record": {"id": 1}, "old_record": {"id": 0}}),
        ));
        assert_eq!(
            event,
            Some(RealtimeEvent::TableChange {
                table: "orders".into(),
                change: ChangeKind::Update,
                record: json!({"id": 1}),
                old_record: Some(json!({"id": 0})),
            })
        );

        // A change without a table cannot be routed.
        assert_eq!(
            RealtimeEvent::from_frame(&frame(FrameType::Event, "insert", json!({}))),
            None
        );
    }

    #[test]
    fn test_other_frames() {
        assert!(matches!(
            RealtimeEvent::from_frame(&frame(FrameType::Event, "stream", json!({"stream": "clicks", "data": 5}))),
            Some(RealtimeEvent::Stream { ref stream, .. }) if stream == "clicks"
        ));
        assert!(matches!(
            RealtimeEvent::from_frame(&frame(FrameType::Error, "error", json!({"message": "bad topic"}))),
            Some(RealtimeEvent::Error { ref message }) if message == "bad topic"
        ));
        assert_eq!(
            RealtimeEvent::from_frame(&frame(FrameType::Heartbeat, "heartbeat", json!({}))),
            None
        );
    }
}
