//! Statement assembly.
//!
//! Every builder returns statement text terminated by `;`. Literal values are
//! escaped through [`SqlValue::to_sql`]; the only text spliced verbatim is a
//! predicate stored under [`POLICY_PREDICATE_KEY`].

use regex::Regex;
use std::sync::LazyLock;

use crate::descriptor::{Filter, Operator, OrderBy, POLICY_PREDICATE_KEY, QueryDescriptor, WhereCondition};
use crate::error::BuildError;
use crate::value::SqlValue;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .unwrap_or_else(|e| panic!("identifier pattern is invalid: {e}"))
});

/// Check that `name` is a plain, optionally qualified, identifier.
pub fn validate_identifier(name: &str) -> Result<(), BuildError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(BuildError::InvalidIdentifier(name.to_string()))
    }
}

/// Build `SELECT <fields> FROM <table> [WHERE ..] [ORDER BY ..] [LIMIT n] [OFFSET m];`.
///
/// An empty field list, or a list holding only `*`, selects every column.
pub fn build_select(
    table: &str,
    fields: &[String],
    filter: Option<&Filter>,
    order_by: &[OrderBy],
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<String, BuildError> {
    render_select(table, fields, filter, order_by, limit, offset, false)
}

pub(crate) fn build_select_with(descriptor: &QueryDescriptor) -> Result<String, BuildError> {
    render_select(
        &descriptor.table,
        &descriptor.fields,
        Some(&descriptor.filter),
        &descriptor.order_by,
        descriptor.limit,
        descriptor.offset,
        descriptor.emit_changes,
    )
}

fn render_select(
    table: &str,
    fields: &[String],
    filter: Option<&Filter>,
    order_by: &[OrderBy],
    limit: Option<u64>,
    offset: Option<u64>,
    emit_changes: bool,
) -> Result<String, BuildError> {
    validate_identifier(table)?;

    let columns = if fields.is_empty() || (fields.len() == 1 && fields[0] == "*") {
        "*".to_string()
    } else {
        for field in fields {
            validate_identifier(field)?;
        }
        fields.join(", ")
    };

    let mut sql = format!("SELECT {} FROM {}", columns, table);

    if let Some(filter) = filter.filter(|f| !f.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(&render_where(filter)?);
    }

    if !order_by.is_empty() {
        let terms = order_by
            .iter()
            .map(|o| {
                validate_identifier(&o.field)?;
                Ok(format!("{} {}", o.field, o.direction))
            })
            .collect::<Result<Vec<_>, BuildError>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    if emit_changes {
        sql.push_str(" EMIT CHANGES");
    }

    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = offset {
        sql.push_str(&format!(" OFFSET {}", offset));
    }

    sql.push(';');
    Ok(sql)
}

/// Build `INSERT INTO <table> (cols) VALUES (vals);`.
pub fn build_insert(table: &str, values: &[(String, SqlValue)]) -> Result<String, BuildError> {
    validate_identifier(table)?;
    if values.is_empty() {
        return Err(BuildError::EmptyValues(table.to_string()));
    }

    let mut columns = Vec::with_capacity(values.len());
    let mut literals = Vec::with_capacity(values.len());
    for (column, value) in values {
        validate_identifier(column)?;
        columns.push(column.as_str());
        literals.push(value.to_sql(column)?);
    }

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({});",
        table,
        columns.join(", "),
        literals.join(", ")
    ))
}

/// Build `UPDATE <table> SET col = val, .. WHERE ..;`. The filter must not be empty.
pub fn build_update(
    table: &str,
    filter: &Filter,
    values: &[(String, SqlValue)],
) -> Result<String, BuildError> {
    validate_identifier(table)?;
    if values.is_empty() {
        return Err(BuildError::EmptyValues(table.to_string()));
    }
    require_filter("UPDATE", table, filter)?;

    let assignments = values
        .iter()
        .map(|(column, value)| {
            validate_identifier(column)?;
            Ok(format!("{} = {}", column, value.to_sql(column)?))
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    Ok(format!(
        "UPDATE {} SET {} WHERE {};",
        table,
        assignments.join(", "),
        render_where(filter)?
    ))
}

/// Build `DELETE FROM <table> WHERE ..;`. The filter must not be empty.
pub fn build_delete(table: &str, filter: &Filter) -> Result<String, BuildError> {
    validate_identifier(table)?;
    require_filter("DELETE", table, filter)?;
    Ok(format!("DELETE FROM {} WHERE {};", table, render_where(filter)?))
}

/// Build an unfiltered `DELETE FROM <table>;`.
pub fn build_delete_all(table: &str) -> Result<String, BuildError> {
    validate_identifier(table)?;
    Ok(format!("DELETE FROM {};", table))
}

fn require_filter(operation: &str, table: &str, filter: &Filter) -> Result<(), BuildError> {
    if filter.is_empty() {
        return Err(BuildError::MissingFilter {
            operation: operation.to_string(),
            table: table.to_string(),
        });
    }
    Ok(())
}

/// Render a filter as AND-joined predicates, without the `WHERE` keyword.
pub fn render_where(filter: &Filter) -> Result<String, BuildError> {
    let parts = filter
        .iter()
        .map(|(field, condition)| render_condition(field, condition))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(" AND "))
}

fn render_condition(field: &str, condition: &WhereCondition) -> Result<String, BuildError> {
    match condition {
        WhereCondition::Raw(predicate) if field == POLICY_PREDICATE_KEY => {
            return Ok(format!("({})", predicate));
        }
        WhereCondition::Raw(_) => {
            return Err(BuildError::UnsupportedValue {
                field: field.to_string(),
                reason: "raw predicates are only accepted from the policy engine".to_string(),
            });
        }
        _ if field == POLICY_PREDICATE_KEY => {
            return Err(BuildError::ReservedField(field.to_string()));
        }
        _ => validate_identifier(field)?,
    }

    match condition {
        WhereCondition::Raw(predicate) => Ok(format!("({})", predicate)),
        WhereCondition::Equals(value) | WhereCondition::Compare(Operator::Eq, value)
            if value.is_null() =>
        {
            Ok(format!("{} IS NULL", field))
        }
        WhereCondition::Compare(Operator::Ne, value) if value.is_null() => {
            Ok(format!("{} IS NOT NULL", field))
        }
        WhereCondition::Equals(value) => Ok(format!("{} = {}", field, value.to_sql(field)?)),
        WhereCondition::Compare(Operator::In, value) => {
            Ok(format!("{} IN {}", field, value.to_sql_list(field)?))
        }
        WhereCondition::Compare(op, value) => {
            Ok(format!("{} {} {}", field, op.as_sql(), value.to_sql(field)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OrderBy;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_star_without_filters() {
        let sql = build_select("table", &cols(&["*"]), None, &[], None, None).unwrap();
        assert_eq!(sql, "SELECT * FROM table;");

        let sql = build_select("table", &[], Some(&Filter::new()), &[], None, None).unwrap();
        assert_eq!(sql, "SELECT * FROM table;");
    }

    #[test]
    fn test_select_full() {
        let filter = Filter::new()
            .eq("status", "open")
            .cmp("total", Operator::Gt, 100)
            .cmp("region", Operator::In, vec!["eu", "us"]);

        let sql = build_select(
            "orders",
            &cols(&["id", "total"]),
            Some(&filter),
            &[OrderBy::desc("created_at"), OrderBy::asc("id")],
            Some(10),
            Some(20),
        )
        .unwrap();

        assert_eq!(
            sql,
            "SELECT id, total FROM orders WHERE status = 'open' AND total > 100 \
             AND region IN ('eu', 'us') ORDER BY created_at DESC, id ASC LIMIT 10 OFFSET 20;"
        );
    }

    #[test]
    fn test_null_comparisons() {
        let filter = Filter::new()
            .eq("deleted_at", SqlValue::Null)
            .cmp("owner", Operator::Ne, SqlValue::Null);
        assert_eq!(
            render_where(&filter).unwrap(),
            "deleted_at IS NULL AND owner IS NOT NULL"
        );
    }

    #[test]
    fn test_insert_escapes_injection() {
        let sql = build_insert(
            "users",
            &[
                ("name".to_string(), SqlValue::from("'; DROP TABLE x; --")),
                ("active".to_string(), SqlValue::from(true)),
            ],
        )
        .unwrap();

        assert_eq!(
            sql,
            "INSERT INTO users (name, active) VALUES ('''; DROP TABLE x; --', TRUE);"
        );
        // The only statement terminator outside a literal is the final one.
        assert_eq!(statement_terminators(&sql), 1);
    }

    #[test]
    fn test_update_escapes_injection() {
        let sql = build_update(
            "users",
            &Filter::new().eq("id", 7),
            &[("name".to_string(), SqlValue::from("O'Brien'; DROP TABLE x; --"))],
        )
        .unwrap();

        assert_eq!(
            sql,
            "UPDATE users SET name = 'O''Brien''; DROP TABLE x; --' WHERE id = 7;"
        );
        assert_eq!(statement_terminators(&sql), 1);
    }

    #[test]
    fn test_delete_requires_filter() {
        let err = build_delete("users", &Filter::new()).unwrap_err();
        assert!(matches!(err, BuildError::MissingFilter { .. }));
        assert_eq!(build_delete_all("users").unwrap(), "DELETE FROM users;");
        assert_eq!(
            build_delete("users", &Filter::new().eq("id", 1)).unwrap(),
            "DELETE FROM users WHERE id = 1;"
        );
    }

    #[test]
    fn test_policy_predicate_spliced_verbatim() {
        let filter = Filter::new()
            .eq("status", "open")
            .with_policy_predicate("tenant_id = 'A' AND owner = 'u1'");
        let sql = build_select("orders", &[], Some(&filter), &[], None, None).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM orders WHERE status = 'open' AND (tenant_id = 'A' AND owner = 'u1');"
        );
    }

    #[test]
    fn test_raw_condition_rejected_on_regular_field() {
        let filter = Filter::new().with("status", WhereCondition::Raw("1=1".into()));
        assert!(render_where(&filter).is_err());
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        assert!(matches!(
            build_select("orders; DROP", &[], None, &[], None, None),
            Err(BuildError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            build_select("orders", &cols(&["id", "name--"]), None, &[], None, None),
            Err(BuildError::InvalidIdentifier(_))
        ));
        assert!(validate_identifier("public.orders").is_ok());
    }

    #[test]
    fn test_in_requires_list() {
        let filter = Filter::new().cmp("id", Operator::In, 5);
        assert_eq!(
            render_where(&filter).unwrap_err(),
            BuildError::InvalidInList("id".to_string())
        );
    }

    #[test]
    fn test_descriptor_emit_changes() {
        let descriptor = QueryDescriptor::from_json(&json!({
            "table": "pageviews",
            "where": {"page": {"like": "/docs%"}},
            "limit": 5
        }))
        .unwrap()
        .emit_changes();

        assert_eq!(
            descriptor.build().unwrap(),
            "SELECT * FROM pageviews WHERE page LIKE '/docs%' EMIT CHANGES LIMIT 5;"
        );
    }

    #[test]
    fn test_descriptor_order_by_priority() {
        let descriptor = QueryDescriptor::from_json(&json!({
            "table": "users",
            "where": {"status": "active", "age": {"gte": 18}},
            "orderBy": {"name": "asc", "age": "desc"}
        }))
        .unwrap();

        assert_eq!(
            descriptor.build().unwrap(),
            "SELECT * FROM users WHERE status = 'active' AND age >= 18 ORDER BY name ASC, age DESC;"
        );
    }

    fn statement_terminators(sql: &str) -> usize {
        let mut in_literal = false;
        let mut count = 0;
        for c in sql.chars() {
            match c {
                '\'' => in_literal = !in_literal,
                ';' if !in_literal => count += 1,
                _ => {}
            }
        }
        count
    }
}
