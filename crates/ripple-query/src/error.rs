//! Error types for statement building.

use thiserror::Error;

/// Validation failures raised while turning a descriptor into a statement.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    /// Table or column name is not a plain (optionally qualified) identifier.
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Operator object names an operator outside {eq, ne, gt, gte, lt, lte, like, in}.
    #[error("unsupported operator '{operator}' on field '{field}'")]
    UnsupportedOperator { field: String, operator: String },

    /// Operator object is empty or carries several operators.
    #[error("field '{field}' must carry exactly one operator, found {count}")]
    AmbiguousCondition { field: String, count: usize },

    /// `in` was given something other than a non-empty list.
    #[error("'in' on field '{0}' requires a non-empty list")]
    InvalidInList(String),

    /// Value cannot be rendered as a literal (non-finite float, nested list).
    #[error("unsupported value for '{field}': {reason}")]
    UnsupportedValue { field: String, reason: String },

    /// The reserved policy predicate key was supplied by a caller.
    #[error("field name '{0}' is reserved")]
    ReservedField(String),

    /// INSERT/UPDATE without any column values.
    #[error("statement for table '{0}' has no values")]
    EmptyValues(String),

    /// UPDATE/DELETE without a filter.
    #[error("{operation} on table '{table}' requires a filter")]
    MissingFilter { operation: String, table: String },

    /// Descriptor JSON has the wrong shape.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),
}
