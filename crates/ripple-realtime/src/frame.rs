//! Wire frames and socket URLs.
//!
//! Every message in either direction is one JSON object:
//!
//! ```json
//! {"topic": "orders", "ref": "7", "type": "subscribe", "event": "table_changes",
//!  "payload": {"id": "sub-1", "table": "orders", "change": "*"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use url::Url;

use crate::error::RealtimeError;

pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const PRESENCE_CHANGE_EVENT: &str = "presence_change";
pub const PRESENCE_TRACK_EVENT: &str = "track";
pub const PRESENCE_UNTRACK_EVENT: &str = "untrack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    Broadcast,
    Presence,
    Heartbeat,
    /// Table change or stream event pushed by the server.
    Event,
    Reply,
    Error,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Broadcast => "broadcast",
            FrameType::Presence => "presence",
            FrameType::Heartbeat => "heartbeat",
            FrameType::Event => "event",
            FrameType::Reply => "reply",
            FrameType::Error => "error",
            FrameType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(
        topic: impl Into<String>,
        reference: impl Into<String>,
        frame_type: FrameType,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            reference: Some(reference.into()),
            frame_type,
            event: event.into(),
            payload,
        }
    }

    pub fn heartbeat(topic: &str, reference: impl Into<String>) -> Self {
        Self::new(topic, reference, FrameType::Heartbeat, HEARTBEAT_EVENT, json!({}))
    }

    pub fn broadcast(topic: &str, reference: impl Into<String>, event: &str, payload: Value) -> Self {
        Self::new(topic, reference, FrameType::Broadcast, event, payload)
    }

    pub fn parse(text: &str) -> Result<Self, RealtimeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, RealtimeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Socket URL for `topic`: the base URL with the topic appended to its path
/// and the API key as the `apikey` query parameter. `http(s)` bases are
/// switched to `ws(s)`.
pub fn socket_url(base: &str, topic: &str, api_key: Option<&str>) -> Result<Url, RealtimeError> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RealtimeError::InvalidUrl(format!(
                "unsupported scheme '{}' in '{}'",
                other, base
            )));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(RealtimeError::InvalidUrl(format!("cannot use '{}' as a socket url", base)));
    }

    url.path_segments_mut()
        .map_err(|_| RealtimeError::InvalidUrl(format!("'{}' cannot be a base url", base)))?
        .pop_if_empty()
        .push(topic);

    if let Some(key) = api_key {
        url.query_pairs_mut().append_pair("apikey", key);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::broadcast("room:1", "3", "cursor", json!({"x": 1}));
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"topic": "room:1", "ref": "3", "type": "broadcast", "event": "cursor", "payload": {"x": 1}})
        );
    }

    #[test]
    fn test_parse_tolerates_unknown_type_and_missing_fields() {
        let frame = Frame::parse(r#"{"topic":"t","type":"phx_close"}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown);
        assert_eq!(frame.reference, None);
        assert_eq!(frame.payload, Value::Null);
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn test_socket_url() {
        let url = socket_url("ws://localhost:4000/realtime/", "orders", Some("k&1")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:4000/realtime/orders?apikey=k%261");

        let url = socket_url("https://rt.example.com", "room:1", None).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/room:1");

        assert!(socket_url("ftp://example.com", "t", None).is_err());
        assert!(socket_url("not a url", "t", None).is_err());
    }
}
