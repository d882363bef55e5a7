//! Structured query descriptors.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::builder;
use crate::error::BuildError;
use crate::value::SqlValue;

/// Reserved filter key carrying a policy predicate.
///
/// Conditions under this key are spliced into the statement verbatim. Only
/// [`Filter::with_policy_predicate`] can set it; descriptors parsed from JSON
/// may not use it.
pub const POLICY_PREDICATE_KEY: &str = "__policy_predicate";

/// Comparison operator of an operator-object condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::In => "IN",
        }
    }
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Operator::Eq),
            "ne" => Ok(Operator::Ne),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Gte),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Lte),
            "like" => Ok(Operator::Like),
            "in" => Ok(Operator::In),
            _ => Err(()),
        }
    }
}

/// A single filter condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereCondition {
    /// `field = value`
    Equals(SqlValue),
    /// `field <op> value`
    Compare(Operator, SqlValue),
    /// Pre-composed predicate, trusted verbatim.
    Raw(String),
}

impl WhereCondition {
    /// Parse a condition from its JSON form: a scalar means equality, an
    /// object must hold exactly one known operator.
    pub fn from_json(field: &str, value: &Value) -> Result<Self, BuildError> {
        let Value::Object(ops) = value else {
            return Ok(WhereCondition::Equals(SqlValue::from(value)));
        };

        if ops.len() != 1 {
            return Err(BuildError::AmbiguousCondition {
                field: field.to_string(),
                count: ops.len(),
            });
        }

        let (name, operand) = ops.iter().next().ok_or_else(|| BuildError::AmbiguousCondition {
            field: field.to_string(),
            count: 0,
        })?;
        let operator = name
            .parse::<Operator>()
            .map_err(|()| BuildError::UnsupportedOperator {
                field: field.to_string(),
                operator: name.clone(),
            })?;

        Ok(WhereCondition::Compare(operator, SqlValue::from(operand)))
    }
}

/// Ordered, AND-joined set of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, WhereCondition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `field = value`.
    pub fn eq(self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.with(field, WhereCondition::Equals(value.into()))
    }

    /// Add `field <op> value`.
    pub fn cmp(self, field: impl Into<String>, op: Operator, value: impl Into<SqlValue>) -> Self {
        self.with(field, WhereCondition::Compare(op, value.into()))
    }

    /// Add a condition. A later condition on the same field replaces the earlier one.
    pub fn with(mut self, field: impl Into<String>, condition: WhereCondition) -> Self {
        let field = field.into();
        match self.conditions.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = condition,
            None => self.conditions.push((field, condition)),
        }
        self
    }

    /// Attach a policy predicate. It is AND-joined with the other conditions
    /// and never escaped.
    pub fn with_policy_predicate(self, predicate: impl Into<String>) -> Self {
        self.with(POLICY_PREDICATE_KEY, WhereCondition::Raw(predicate.into()))
    }

    /// Parse a filter from a JSON object of `field -> condition`.
    pub fn from_json(value: &Value) -> Result<Self, BuildError> {
        let Value::Object(map) = value else {
            return Err(BuildError::MalformedDescriptor(
                "'where' must be an object".to_string(),
            ));
        };

        let mut filter = Filter::new();
        for (field, condition) in map {
            if field == POLICY_PREDICATE_KEY {
                return Err(BuildError::ReservedField(field.clone()));
            }
            filter = filter.with(field.clone(), WhereCondition::from_json(field, condition)?);
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WhereCondition)> {
        self.conditions.iter().map(|(f, c)| (f.as_str(), c))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// Everything needed to build a SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub table: String,
    /// Empty means `*`.
    pub fields: Vec<String>,
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Build a continuously emitting (push) query.
    pub emit_changes: bool,
}

impl QueryDescriptor {
    /// Select every field of `table`.
    pub fn select(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            filter: Filter::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            emit_changes: false,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn emit_changes(mut self) -> Self {
        self.emit_changes = true;
        self
    }

    /// Render the descriptor as a SELECT statement.
    pub fn build(&self) -> Result<String, BuildError> {
        builder::build_select_with(self)
    }

    /// Parse a descriptor from JSON:
    ///
    /// ```json
    /// {"table": "orders", "fields": ["id"], "where": {"status": "open"},
    ///  "orderBy": {"created_at": "desc"}, "limit": 10, "offset": 0}
    /// ```
    pub fn from_json(value: &Value) -> Result<Self, BuildError> {
        let obj = value.as_object().ok_or_else(|| {
            BuildError::MalformedDescriptor("descriptor must be an object".to_string())
        })?;

        let table = obj
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::MalformedDescriptor("missing 'table'".to_string()))?;
        let mut descriptor = QueryDescriptor::select(table);

        if let Some(fields) = obj.get("fields") {
            let fields = fields.as_array().ok_or_else(|| {
                BuildError::MalformedDescriptor("'fields' must be an array".to_string())
            })?;
            descriptor.fields = fields
                .iter()
                .map(|f| {
                    f.as_str().map(str::to_string).ok_or_else(|| {
                        BuildError::MalformedDescriptor("field names must be strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(filter) = obj.get("where") {
            descriptor.filter = Filter::from_json(filter)?;
        }

        if let Some(order) = obj.get("orderBy") {
            descriptor.order_by = parse_order_by(order)?;
        }

        descriptor.limit = parse_count(obj, "limit")?;
        descriptor.offset = parse_count(obj, "offset")?;
        descriptor.emit_changes = obj
            .get("emitChanges")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(descriptor)
    }
}

fn parse_order_by(value: &Value) -> Result<Vec<OrderBy>, BuildError> {
    let map: &Map<String, Value> = value.as_object().ok_or_else(|| {
        BuildError::MalformedDescriptor("'orderBy' must be an object".to_string())
    })?;

    map.iter()
        .map(|(field, dir)| {
            let direction = match dir.as_str().map(str::to_ascii_lowercase).as_deref() {
                Some("asc") => OrderDirection::Asc,
                Some("desc") => OrderDirection::Desc,
                _ => {
                    return Err(BuildError::MalformedDescriptor(format!(
                        "order direction for '{}' must be 'asc' or 'desc'",
                        field
                    )));
                }
            };
            Ok(OrderBy {
                field: field.clone(),
                direction,
            })
        })
        .collect()
}

fn parse_count(obj: &Map<String, Value>, key: &str) -> Result<Option<u64>, BuildError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            BuildError::MalformedDescriptor(format!("'{}' must be a non-negative integer", key))
        }),
    }
}
