//! Rows and aggregated pull results.

use ripple_core::RowFormat;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::QueryHeader;

/// A result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Row {
    /// Values aligned with the header's column names.
    Positional(Vec<Value>),
    /// Values keyed by column name.
    Keyed(Map<String, Value>),
}

impl Row {
    /// Shape `values` according to `format`.
    ///
    /// Keyed rows use the header's column names; values without a matching
    /// column are keyed by position (`"3"`).
    pub fn new(values: Vec<Value>, header: Option<&QueryHeader>, format: RowFormat) -> Self {
        match format {
            RowFormat::Positional => Row::Positional(values),
            RowFormat::Keyed => {
                let names = header.map(|h| h.column_names.as_slice()).unwrap_or(&[]);
                let map = values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| {
                        let key = names.get(i).cloned().unwrap_or_else(|| i.to_string());
                        (key, v)
                    })
                    .collect();
                Row::Keyed(map)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Row::Positional(values) => values.len(),
            Row::Keyed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of column `name`. Positional rows need the header to resolve it.
    pub fn get<'a>(&'a self, name: &str, header: Option<&QueryHeader>) -> Option<&'a Value> {
        match self {
            Row::Keyed(map) => map.get(name),
            Row::Positional(values) => {
                let idx = header?
                    .column_names
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(name))?;
                values.get(idx)
            }
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Row::Positional(values) => Value::Array(values),
            Row::Keyed(map) => Value::Object(map),
        }
    }
}

/// Everything a pull query returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub header: Option<QueryHeader>,
    pub rows: Vec<Row>,
    /// Acknowledgements and status objects (DDL/DML responses, final messages).
    pub messages: Vec<Value>,
}

impl QueryResult {
    pub fn query_id(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.query_id.as_deref())
    }

    pub fn column_names(&self) -> &[String] {
        self.header
            .as_ref()
            .map(|h| h.column_names.as_slice())
            .unwrap_or(&[])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the response was an acknowledgement rather than a result set.
    pub fn is_acknowledgement(&self) -> bool {
        self.header.is_none() && self.rows.is_empty() && !self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header() -> QueryHeader {
        QueryHeader {
            query_id: None,
            column_names: vec!["ID".to_string(), "PAGE".to_string()],
            column_types: Vec::new(),
        }
    }

    #[test]
    fn test_keyed_rows_use_column_names() {
        let row = Row::new(vec![json!(1), json!("/docs"), json!(true)], Some(&header()), RowFormat::Keyed);
        assert_eq!(row.into_value(), json!({"ID": 1, "PAGE": "/docs", "2": true}));
    }

    #[test]
    fn test_keyed_rows_follow_header_order() {
        let h = QueryHeader {
            query_id: None,
            column_names: vec!["ZONE".to_string(), "COUNT".to_string(), "AVG_MS".to_string()],
            column_types: Vec::new(),
        };
        let row = Row::new(vec![json!("eu"), json!(3), json!(12.5)], Some(&h), RowFormat::Keyed);
        let Row::Keyed(map) = &row else {
            panic!("expected a keyed row");
        };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ZONE", "COUNT", "AVG_MS"]);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"ZONE":"eu","COUNT":3,"AVG_MS":12.5}"#
        );
    }

    #[test]
    fn test_positional_lookup_by_name() {
        let h = header();
        let row = Row::new(vec![json!(7), json!("/blog")], Some(&h), RowFormat::Positional);
        assert_eq!(row.get("page", Some(&h)), Some(&json!("/blog")));
        assert_eq!(row.get("page", None), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_acknowledgement_result() {
        let result = QueryResult {
            messages: vec![json!({"@type": "currentStatus"})],
            ..Default::default()
        };
        assert!(result.is_acknowledgement());
        assert!(result.column_names().is_empty());
    }
}
