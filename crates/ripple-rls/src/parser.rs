//! Statement classification and table extraction.
//!
//! Classification is keyword based. Table extraction walks the `sqlparser`
//! AST when the statement parses; stream-dialect statements that the generic
//! parser rejects fall back to matching identifiers after `FROM`, `JOIN`,
//! `INTO` and `UPDATE`. The fallback over-matches rather than under-matches.

use regex::Regex;
use ripple_core::PolicyOperation;
use serde::Serialize;
use sqlparser::ast::{ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::LazyLock;

use crate::error::RlsError;
use crate::scan::Scan;

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern}: {e}"))
}

static LEADING_KEYWORD: LazyLock<Regex> = LazyLock::new(|| regex(r"^[\s(;]*([A-Z]+)"));
static MAIN_VERB: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(SELECT|INSERT|UPDATE|DELETE)\b"));
static EMIT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?i)\s+EMIT\s+(CHANGES|FINAL)\b"));
static TABLE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(FROM|JOIN|INTO|UPDATE)\s+"));
static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"^[A-Z_][A-Z0-9_]*(\.[A-Z_][A-Z0-9_]*)?")
});
static ALIAS: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s+(?:AS\s+)?([A-Z_][A-Z0-9_]*)"));

/// Words that can follow a table name without being its alias.
const NOT_ALIASES: &[&str] = &[
    "AND", "AS", "CROSS", "EMIT", "EXCEPT", "FULL", "GROUP", "HAVING", "INNER", "INTERSECT",
    "JOIN", "LEFT", "LIMIT", "NATURAL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PARTITION",
    "RETURNING", "RIGHT", "SELECT", "SET", "UNION", "USING", "VALUES", "WHERE", "WINDOW", "WITH",
];

/// Statement kind as seen by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    /// SHOW, DESCRIBE, EXPLAIN, TERMINATE and anything else.
    Other,
}

impl StatementKind {
    /// Policy operation governing this kind, if any.
    pub fn policy_operation(self) -> Option<PolicyOperation> {
        match self {
            StatementKind::Select => Some(PolicyOperation::Select),
            StatementKind::Insert => Some(PolicyOperation::Insert),
            StatementKind::Update => Some(PolicyOperation::Update),
            StatementKind::Delete => Some(PolicyOperation::Delete),
            _ => None,
        }
    }

    /// Whether the statement needs an elevated role.
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            StatementKind::Create | StatementKind::Drop | StatementKind::Alter | StatementKind::Truncate
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Create => "CREATE",
            StatementKind::Drop => "DROP",
            StatementKind::Alter => "ALTER",
            StatementKind::Truncate => "TRUNCATE",
            StatementKind::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// A reference to a table in a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    /// Table name as written, without identifier quotes.
    pub name: String,
    /// Alias on the outermost statement, if any.
    pub alias: Option<String>,
    /// Referenced from the outermost FROM/JOIN list or as the DML target.
    pub outer: bool,
    /// Referenced inside a subquery, derived table or common table expression.
    pub nested: bool,
}

/// Result of analysing a statement.
#[derive(Debug, Clone)]
pub struct StatementAnalysis {
    pub kind: StatementKind,
    /// Referenced tables in first-seen order, CTE names excluded.
    pub tables: Vec<TableReference>,
    /// Relations in the outermost FROM/JOIN list, CTE references included.
    pub outer_relations: usize,
    /// The outermost query is a UNION/INTERSECT/EXCEPT.
    pub set_operation: bool,
    /// More than one statement in the text.
    pub multiple_statements: bool,
    /// Tables came from the AST rather than the keyword fallback.
    pub parsed: bool,
}

/// Analyzes statements to classify them and extract table references.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementAnalyzer;

impl StatementAnalyzer {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Parse a statement with the generic dialect after stripping
    /// stream-only `EMIT CHANGES`/`EMIT FINAL` suffixes.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, RlsError> {
        let stripped = EMIT_SUFFIX.replace_all(sql, "");
        Parser::parse_sql(&GenericDialect {}, &stripped).map_err(|e| RlsError::ParseError(e.to_string()))
    }

    /// Classify a statement by its leading keyword.
    ///
    /// `WITH` statements are classified by the first top-level verb after the
    /// common table expressions.
    pub fn classify(&self, sql: &str) -> StatementKind {
        let scan = Scan::new(sql);
        let Some(keyword) = LEADING_KEYWORD
            .captures(scan.text())
            .and_then(|c| c.get(1))
        else {
            return StatementKind::Other;
        };

        match keyword.as_str() {
            "SELECT" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" => StatementKind::Create,
            "DROP" => StatementKind::Drop,
            "ALTER" => StatementKind::Alter,
            "TRUNCATE" => StatementKind::Truncate,
            "WITH" => match scan
                .find_top_level(&MAIN_VERB, keyword.end())
                .map(|m| m.as_str())
            {
                Some("INSERT") => StatementKind::Insert,
                Some("UPDATE") => StatementKind::Update,
                Some("DELETE") => StatementKind::Delete,
                _ => StatementKind::Select,
            },
            _ => StatementKind::Other,
        }
    }

    /// Classify the statement and extract the tables it references.
    pub fn analyze(&self, sql: &str) -> StatementAnalysis {
        let kind = self.classify(sql);

        match self.parse(sql) {
            Ok(statements) if !statements.is_empty() => {
                let mut collector = TableCollector::default();
                for stmt in &statements {
                    collector.collect(stmt);
                }
                StatementAnalysis {
                    kind,
                    tables: collector.finish(),
                    outer_relations: collector.outer_relations(),
                    set_operation: collector.set_operation,
                    multiple_statements: statements.len() > 1,
                    parsed: true,
                }
            }
            Ok(_) => StatementAnalysis {
                kind,
                tables: Vec::new(),
                outer_relations: 0,
                set_operation: false,
                multiple_statements: false,
                parsed: true,
            },
            Err(e) => {
                tracing::debug!(error = %e, "Statement not parsed, using keyword table extraction");
                let scan = Scan::new(sql);
                let tables = extract_tables_by_keyword(sql, &scan);
                StatementAnalysis {
                    kind,
                    outer_relations: tables.iter().filter(|t| t.outer).count(),
                    tables,
                    set_operation: has_top_level_set_operation(&scan),
                    multiple_statements: has_trailing_statement(&scan),
                    parsed: false,
                }
            }
        }
    }
}

/// AST visitor collecting table names, outer aliases and CTE names.
#[derive(Default)]
struct TableCollector {
    depth: usize,
    outer_depth: usize,
    ctes: HashSet<String>,
    tables: Vec<TableReference>,
    set_operation: bool,
}

impl TableCollector {
    fn collect(&mut self, stmt: &Statement) {
        self.depth = 0;
        self.outer_depth = usize::from(matches!(stmt, Statement::Query(_)));
        if let Statement::Insert(insert) = stmt {
            self.record(&insert.table.to_string(), None);
        }
        let _ = stmt.visit(self);
    }

    fn record(&mut self, raw_name: &str, alias: Option<String>) {
        let name = raw_name.replace(['"', '`'], "");
        let outer = self.depth == self.outer_depth;
        merge_reference(&mut self.tables, name, alias, outer);
    }

    fn outer_relations(&self) -> usize {
        self.tables.iter().filter(|t| t.outer).count()
    }

    fn finish(&self) -> Vec<TableReference> {
        self.tables
            .iter()
            .filter(|t| !self.ctes.contains(&t.name.to_ascii_lowercase()))
            .cloned()
            .collect()
    }
}

impl Visitor for TableCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        if self.depth == 0 && matches!(query.body.as_ref(), SetExpr::SetOperation { .. }) {
            self.set_operation = true;
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { name, alias, .. } = factor {
            self.record(&name.to_string(), alias.as_ref().map(|a| a.name.value.clone()));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.record(&relation.to_string(), None);
        ControlFlow::Continue(())
    }
}

/// Record a reference, folding repeats of the same table into one entry.
fn merge_reference(tables: &mut Vec<TableReference>, name: String, alias: Option<String>, outer: bool) {
    let alias = alias.filter(|_| outer);
    match tables.iter_mut().find(|t| t.name.eq_ignore_ascii_case(&name)) {
        Some(existing) => {
            if existing.alias.is_none() {
                existing.alias = alias;
            }
            existing.outer |= outer;
            existing.nested |= !outer;
        }
        None => tables.push(TableReference {
            name,
            alias,
            outer,
            nested: !outer,
        }),
    }
}

/// Keyword-adjacent identifier matching, including comma-separated lists
/// after `FROM`.
fn extract_tables_by_keyword(sql: &str, scan: &Scan) -> Vec<TableReference> {
    let text = scan.text();
    let mut tables: Vec<TableReference> = Vec::new();

    for keyword in TABLE_KEYWORD.captures_iter(text) {
        let (Some(whole), Some(word)) = (keyword.get(0), keyword.get(1)) else {
            continue;
        };
        let outer = scan.depth_at(word.start()) == 0;
        let mut pos = whole.end();

        loop {
            let Some(name) = TABLE_NAME.find(&text[pos..]) else {
                break;
            };
            let name_start = pos + name.start();
            let name_end = pos + name.end();
            let original = &sql[name_start..name_end];
            pos = name_end;

            let mut alias = None;
            if let Some(caps) = ALIAS.captures(&text[pos..]) {
                if let (Some(all), Some(a)) = (caps.get(0), caps.get(1)) {
                    if !NOT_ALIASES.contains(&a.as_str()) {
                        alias = Some(sql[pos + a.start()..pos + a.end()].to_string());
                        pos += all.end();
                    }
                }
            }

            merge_reference(&mut tables, original.to_string(), alias, outer);

            // Only FROM takes a comma-separated list.
            let rest = text[pos..].trim_start();
            if word.as_str() == "FROM" && rest.starts_with(',') {
                pos = text.len() - rest.len() + 1;
                pos += text[pos..].len() - text[pos..].trim_start().len();
            } else {
                break;
            }
        }
    }

    tables
}

fn has_trailing_statement(scan: &Scan) -> bool {
    let text = scan.text();
    text.match_indices(';').any(|(i, _)| {
        scan.depth_at(i) == 0
            && !text[i + 1..]
                .trim_start_matches(|c: char| c == ';' || c.is_whitespace())
                .is_empty()
    })
}

fn has_top_level_set_operation(scan: &Scan) -> bool {
    static SET_OP: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(UNION|INTERSECT|EXCEPT)\b"));
    scan.find_top_level(&SET_OP, 0).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(analysis: &StatementAnalysis) -> Vec<&str> {
        analysis.tables.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_classify() {
        let analyzer = StatementAnalyzer::new();
        assert_eq!(analyzer.classify("  select * from t"), StatementKind::Select);
        assert_eq!(analyzer.classify("INSERT INTO t VALUES (1)"), StatementKind::Insert);
        assert_eq!(analyzer.classify("update t set a = 1"), StatementKind::Update);
        assert_eq!(analyzer.classify("DELETE FROM t"), StatementKind::Delete);
        assert_eq!(analyzer.classify("CREATE STREAM s (id INT)"), StatementKind::Create);
        assert_eq!(analyzer.classify("drop table t"), StatementKind::Drop);
        assert_eq!(analyzer.classify("-- note\nALTER TABLE t"), StatementKind::Alter);
        assert_eq!(analyzer.classify("SHOW STREAMS;"), StatementKind::Other);
        assert_eq!(analyzer.classify("(SELECT 1)"), StatementKind::Select);
    }

    #[test]
    fn test_classify_with_uses_main_verb() {
        let analyzer = StatementAnalyzer::new();
        assert_eq!(
            analyzer.classify("WITH x AS (SELECT id FROM t) SELECT * FROM x"),
            StatementKind::Select
        );
        assert_eq!(
            analyzer.classify("WITH x AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM x)"),
            StatementKind::Delete
        );
    }

    #[test]
    fn test_parse_join_with_aliases() {
        let analysis = StatementAnalyzer::new()
            .analyze("SELECT * FROM orders o JOIN users u ON o.user_id = u.id");

        assert!(analysis.parsed);
        assert_eq!(names(&analysis), vec!["orders", "users"]);
        assert_eq!(analysis.tables[0].alias.as_deref(), Some("o"));
        assert_eq!(analysis.tables[1].alias.as_deref(), Some("u"));
    }

    #[test]
    fn test_subqueries_and_ctes() {
        let analysis = StatementAnalyzer::new().analyze(
            "WITH recent AS (SELECT * FROM orders WHERE ts > 0) \
             SELECT * FROM recent r WHERE r.user_id IN (SELECT id FROM users u2)",
        );

        assert_eq!(names(&analysis), vec!["orders", "users"]);
        // Aliases inside subqueries are not outer aliases.
        assert_eq!(analysis.tables[1].alias, None);
        assert!(analysis.tables.iter().all(|t| t.nested && !t.outer));
        // The CTE reference still counts as an outer relation.
        assert_eq!(analysis.outer_relations, 1);
    }

    #[test]
    fn test_outer_and_nested_references_merged() {
        let analysis = StatementAnalyzer::new().analyze(
            "SELECT * FROM orders JOIN payments ON orders.id = payments.order_id \
             WHERE orders.id IN (SELECT order_id FROM refunds WHERE refunds.id IN (SELECT id FROM orders))",
        );
        assert_eq!(names(&analysis), vec!["orders", "payments", "refunds"]);
        assert_eq!(analysis.outer_relations, 2);
        let flags: Vec<(bool, bool)> = analysis.tables.iter().map(|t| (t.outer, t.nested)).collect();
        assert_eq!(flags, vec![(true, true), (true, false), (false, true)]);
    }

    #[test]
    fn test_derived_table() {
        let analysis = StatementAnalyzer::new()
            .analyze("SELECT t.id FROM (SELECT id FROM payments) AS t");
        assert_eq!(names(&analysis), vec!["payments"]);
    }

    #[test]
    fn test_set_operation_detected() {
        let analysis = StatementAnalyzer::new()
            .analyze("SELECT id FROM orders UNION SELECT id FROM archived_orders");
        assert!(analysis.set_operation);
        assert_eq!(names(&analysis), vec!["orders", "archived_orders"]);
    }

    #[test]
    fn test_dml_targets() {
        let analyzer = StatementAnalyzer::new();
        assert_eq!(
            names(&analyzer.analyze("INSERT INTO orders (id) VALUES (1)")),
            vec!["orders"]
        );
        assert_eq!(
            names(&analyzer.analyze("UPDATE orders SET total = 1 WHERE id = 2")),
            vec!["orders"]
        );
        assert_eq!(
            names(&analyzer.analyze("DELETE FROM orders WHERE id = 2")),
            vec!["orders"]
        );
    }

    #[test]
    fn test_emit_changes_still_parsed() {
        let analysis = StatementAnalyzer::new()
            .analyze("SELECT * FROM pageviews p WHERE p.page = '/' EMIT CHANGES;");
        assert!(analysis.parsed);
        assert_eq!(names(&analysis), vec!["pageviews"]);
        assert_eq!(analysis.tables[0].alias.as_deref(), Some("p"));
    }

    #[test]
    fn test_keyword_fallback_for_stream_dialect() {
        let analysis = StatementAnalyzer::new().analyze(
            "SELECT region, COUNT(*) FROM pageviews pv, users \
             WINDOW TUMBLING (SIZE 1 HOUR) WHERE pv.page = 'from x' GROUP BY region EMIT CHANGES;",
        );

        assert!(!analysis.parsed);
        assert_eq!(names(&analysis), vec!["pageviews", "users"]);
        assert_eq!(analysis.tables[0].alias.as_deref(), Some("pv"));
        assert_eq!(analysis.tables[1].alias, None);
    }

    #[test]
    fn test_multiple_statements_flagged() {
        let analyzer = StatementAnalyzer::new();
        assert!(analyzer.analyze("SELECT * FROM a; DROP TABLE a;").multiple_statements);
        assert!(!analyzer.analyze("SELECT * FROM a WHERE b = ';';").multiple_statements);
        assert!(
            analyzer
                .analyze("SELECT * FROM a WINDOW TUMBLING (SIZE 1 HOUR); DROP STREAM a;")
                .multiple_statements
        );
    }

    #[test]
    fn test_keyword_fallback_over_matches_subqueries() {
        let analysis = StatementAnalyzer::new().analyze(
            "SELECT * FROM a WINDOW TUMBLING (SIZE 1 MINUTE) WHERE id IN (SELECT id FROM b)",
        );
        assert!(!analysis.parsed);
        assert_eq!(names(&analysis), vec!["a", "b"]);
        assert!(analysis.tables[0].outer);
        assert!(analysis.tables[1].nested);
    }
}
