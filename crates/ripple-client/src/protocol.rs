//! Newline-delimited JSON response protocol.
//!
//! Both pull and push queries answer with a body of JSON values separated by
//! newlines:
//!
//! ```text
//! {"queryId":"q-1","columnNames":["ID","PAGE"],"columnTypes":["BIGINT","STRING"]}
//! [1,"/docs"]
//! [2,"/blog"]
//! ```
//!
//! The first object carrying `columnNames` is the header. Arrays are rows.
//! Objects shaped like `{"@type":"statement_error","error_code":N,"message":"..."}`
//! are engine errors; any other object (DDL/DML acknowledgements, final
//! messages) is passed through as a [`StreamFrame::Message`].

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

const PREVIEW_LEN: usize = 80;

/// Column metadata sent ahead of the rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHeader {
    /// Assigned by the engine for push queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub column_names: Vec<String>,
    #[serde(default)]
    pub column_types: Vec<String>,
}

/// Structured error object returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_code: i64,
    pub message: String,
}

impl BackendError {
    /// Recognise an error object: an `@type` ending in `error`, or an
    /// `error_code` together with a `message`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let typed = obj
            .get("@type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.ends_with("error"));
        let coded = obj.contains_key("error_code") && obj.contains_key("message");
        if !(typed || coded) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Parse a whole response body as an error object.
    pub fn from_body(body: &str) -> Option<Self> {
        serde_json::from_str::<Value>(body.trim())
            .ok()
            .and_then(|v| Self::from_value(&v))
    }
}

impl From<BackendError> for ClientError {
    fn from(err: BackendError) -> Self {
        ClientError::Backend {
            error_code: err.error_code,
            message: err.message,
        }
    }
}

/// One parsed line of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Header(QueryHeader),
    Row(Vec<Value>),
    Error(BackendError),
    /// Acknowledgement or status object.
    Message(Value),
}

/// Parse one response line.
///
/// Blank lines and the `[`/`]` framing of array-wrapped bodies yield
/// `Ok(None)`. A trailing comma is ignored for the same reason.
pub fn parse_line(line: &str) -> Result<Option<StreamFrame>, ClientError> {
    let line = line.trim();
    let line = line.strip_suffix(',').unwrap_or(line).trim_end();
    if line.is_empty() || line == "[" || line == "]" {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| ClientError::Parse(format!("{} in line '{}'", e, preview(line))))?;

    match value {
        Value::Array(items) => Ok(Some(classify_array(items))),
        Value::Object(ref obj) if obj.contains_key("columnNames") => {
            let header = serde_json::from_value(value.clone()).map_err(|e| {
                ClientError::Parse(format!("invalid header: {} in line '{}'", e, preview(line)))
            })?;
            Ok(Some(StreamFrame::Header(header)))
        }
        Value::Object(ref obj) => {
            if let Some(columns) = obj
                .get("row")
                .and_then(|r| r.get("columns"))
                .and_then(Value::as_array)
            {
                return Ok(Some(StreamFrame::Row(columns.clone())));
            }
            match BackendError::from_value(&value) {
                Some(err) => Ok(Some(StreamFrame::Error(err))),
                None => Ok(Some(StreamFrame::Message(value))),
            }
        }
        other => Err(ClientError::Parse(format!(
            "expected an object or array, got '{}'",
            preview(&other.to_string())
        ))),
    }
}

/// Arrays are rows, except a non-empty list of `@type` objects which is a
/// statement acknowledgement (or an error within one).
fn classify_array(items: Vec<Value>) -> StreamFrame {
    let is_status_list = !items.is_empty()
        && items
            .iter()
            .all(|item| item.as_object().is_some_and(|o| o.contains_key("@type")));
    if !is_status_list {
        return StreamFrame::Row(items);
    }
    match items.iter().find_map(BackendError::from_value) {
        Some(err) => StreamFrame::Error(err),
        None => StreamFrame::Message(Value::Array(items)),
    }
}

/// Truncated single-line rendering for log messages.
pub(crate) fn preview(line: &str) -> String {
    let flat = line.replace('\n', " ");
    match flat.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

/// Carry-over buffer turning transport chunks into complete lines.
///
/// Chunk boundaries may fall anywhere, including inside a multi-byte
/// character; bytes are only decoded once their line is complete.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every non-blank line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.carry[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = decode(&self.carry[start..end]);
            if !line.is_empty() {
                lines.push(line);
            }
            start = end + 1;
        }
        self.carry.drain(..start);
        lines
    }

    /// Take the unterminated remainder once the transport has closed.
    pub fn finish(&mut self) -> Option<String> {
        let rest = decode(&std::mem::take(&mut self.carry));
        (!rest.is_empty()).then_some(rest)
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Parse a complete body. Malformed lines come back as `Err` items so the
/// caller decides whether to skip them.
pub fn parse_body(body: &[u8]) -> Vec<Result<StreamFrame, ClientError>> {
    let mut buffer = LineBuffer::new();
    let mut lines = buffer.push(body);
    lines.extend(buffer.finish());
    lines
        .iter()
        .filter_map(|line| parse_line(line).transpose())
        .collect()
}

/// Item of a live response stream.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Frame(StreamFrame),
    /// A line that failed to parse; the stream continues.
    Malformed(ClientError),
    /// The transport failed; nothing follows.
    Failed(ClientError),
}

/// Adapt a chunked body into parsed frames.
pub(crate) fn frame_stream<S, B>(chunks: S) -> impl Stream<Item = StreamItem>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
{
    async_stream::stream! {
        let mut buffer = LineBuffer::new();
        let mut failed = false;
        futures::pin_mut!(chunks);

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in buffer.push(bytes.as_ref()) {
                        match parse_line(&line) {
                            Ok(Some(frame)) => yield StreamItem::Frame(frame),
                            Ok(None) => {}
                            Err(e) => yield StreamItem::Malformed(e),
                        }
                    }
                }
                Err(e) => {
                    failed = true;
                    yield StreamItem::Failed(ClientError::Transport(e));
                    break;
                }
            }
        }

        if !failed {
            if let Some(line) = buffer.finish() {
                match parse_line(&line) {
                    Ok(Some(frame)) => yield StreamItem::Frame(frame),
                    Ok(None) => {}
                    Err(e) => yield StreamItem::Malformed(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_line_buffer_carries_partial_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"columnNa").is_empty());
        assert_eq!(buffer.pending(), 10);

        let lines = buffer.push(b"mes\":[\"A\"]}\n[1]\n[2");
        assert_eq!(lines, vec![r#"{"columnNames":["A"]}"#, "[1]"]);

        assert!(buffer.push(b"]").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("[2]"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_split_multibyte_character() {
        let text = "[\"caf\u{e9}\"]\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&text[..split]).is_empty());
        assert_eq!(buffer.push(&text[split..]), vec!["[\"caf\u{e9}\"]"]);
    }

    #[test]
    fn test_line_buffer_handles_crlf_and_blank_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"[1]\r\n\r\n\n[2]\r\n"), vec!["[1]", "[2]"]);
    }

    #[test]
    fn test_parse_header() {
        let frame = parse_line(
            r#"{"queryId":"q-1","columnNames":["ID","PAGE"],"columnTypes":["BIGINT","STRING"]}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Some(StreamFrame::Header(QueryHeader {
                query_id: Some("q-1".to_string()),
                column_names: vec!["ID".to_string(), "PAGE".to_string()],
                column_types: vec!["BIGINT".to_string(), "STRING".to_string()],
            }))
        );
    }

    #[test]
    fn test_parse_rows_and_framing() {
        assert_eq!(
            parse_line(r#"[1,"/docs"],"#).unwrap(),
            Some(StreamFrame::Row(vec![json!(1), json!("/docs")]))
        );
        assert_eq!(
            parse_line(r#"{"row":{"columns":[2,"/blog"]}}"#).unwrap(),
            Some(StreamFrame::Row(vec![json!(2), json!("/blog")]))
        );
        assert_eq!(parse_line("[").unwrap(), None);
        assert_eq!(parse_line("]").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors_and_messages() {
        let frame = parse_line(
            r#"{"@type":"statement_error","error_code":40001,"message":"Line 1: no such stream"}"#,
        )
        .unwrap();
        match frame {
            Some(StreamFrame::Error(err)) => {
                assert_eq!(err.error_code, 40001);
                assert_eq!(err.message, "Line 1: no such stream");
            }
            other => panic!("expected error frame, got {other:?}"),
        }

        let ack = parse_line(r#"[{"@type":"currentStatus","commandStatus":{"status":"SUCCESS"}}]"#)
            .unwrap();
        assert!(matches!(ack, Some(StreamFrame::Message(Value::Array(_)))));

        let done = parse_line(r#"{"finalMessage":"Limit Reached"}"#).unwrap();
        assert!(matches!(done, Some(StreamFrame::Message(_))));
    }

    #[test]
    fn test_malformed_line_is_parse_error() {
        let err = parse_line("{not json").unwrap_err();
        assert!(matches!(err, ClientError::Parse(_)));
        assert!(parse_line("42").is_err());
    }

    #[test]
    fn test_parse_body_keeps_malformed_entries() {
        let body = b"{\"columnNames\":[\"A\"]}\n[1]\n{oops\n[2]";
        let items = parse_body(body);
        assert_eq!(items.len(), 4);
        assert!(items[2].is_err());
        assert!(matches!(items[3], Ok(StreamFrame::Row(_))));
    }

    #[test]
    fn test_backend_error_from_body() {
        let err = BackendError::from_body(r#"{"error_code":50000,"message":"boom"}"#).unwrap();
        assert_eq!(err.error_code, 50000);
        assert!(BackendError::from_body("Service Unavailable").is_none());
        assert!(BackendError::from_body(r#"{"message":"no code"}"#).is_none());
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_LEN + 3);
    }
}
