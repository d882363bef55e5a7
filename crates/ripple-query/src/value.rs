//! Literal values and their SQL rendering.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::BuildError;

/// A literal that can be embedded in a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    /// Only valid as the right-hand side of `IN`.
    List(Vec<SqlValue>),
}

impl SqlValue {
    /// Render the value as SQL literal text.
    ///
    /// `field` is only used to label errors.
    pub fn to_sql(&self, field: &str) -> Result<String, BuildError> {
        match self {
            SqlValue::Null => Ok("NULL".to_string()),
            SqlValue::Bool(true) => Ok("TRUE".to_string()),
            SqlValue::Bool(false) => Ok("FALSE".to_string()),
            SqlValue::Int(n) => Ok(n.to_string()),
            SqlValue::Float(f) => {
                if f.is_finite() {
                    Ok(f.to_string())
                } else {
                    Err(BuildError::UnsupportedValue {
                        field: field.to_string(),
                        reason: format!("non-finite number {}", f),
                    })
                }
            }
            SqlValue::Text(s) => Ok(quote(s)),
            SqlValue::Timestamp(ts) => Ok(quote(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))),
            SqlValue::Date(d) => Ok(quote(&d.format("%Y-%m-%d").to_string())),
            SqlValue::List(_) => Err(BuildError::UnsupportedValue {
                field: field.to_string(),
                reason: "lists are only allowed with 'in'".to_string(),
            }),
        }
    }

    /// Render a list as the parenthesised body of an `IN` comparison.
    pub(crate) fn to_sql_list(&self, field: &str) -> Result<String, BuildError> {
        match self {
            SqlValue::List(items) if !items.is_empty() => {
                let rendered = items
                    .iter()
                    .map(|item| item.to_sql(field))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", rendered.join(", ")))
            }
            _ => Err(BuildError::InvalidInList(field.to_string())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Single-quote a string, doubling embedded quotes.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

impl From<i32> for SqlValue {
    fn from(n: i32) -> Self {
        SqlValue::Int(n.into())
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        SqlValue::Int(n)
    }
}

impl From<u32> for SqlValue {
    fn from(n: u32) -> Self {
        SqlValue::Int(n.into())
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        SqlValue::Float(f)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(ts: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(ts)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(d: NaiveDate) -> Self {
        SqlValue::Date(d)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(items: Vec<T>) -> Self {
        SqlValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(items) => SqlValue::List(items.iter().map(SqlValue::from).collect()),
            // Objects are stored as their JSON text.
            Value::Object(_) => SqlValue::Text(value.to_string()),
        }
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        SqlValue::from(&value)
    }
}
