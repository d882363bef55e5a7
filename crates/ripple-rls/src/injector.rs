//! RLS predicate injection.
//!
//! Predicates are spliced into the outermost statement's WHERE clause as
//! text. An existing condition is parenthesised and AND-joined; a missing
//! WHERE is created in front of the first trailing clause.

use regex::Regex;
use std::sync::LazyLock;

use crate::scan::Scan;

static FROM: LazyLock<Regex> = LazyLock::new(|| pattern(r"\bFROM\b"));
static WHERE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\bWHERE\b"));
/// Clauses that may follow WHERE. `WINDOW` precedes WHERE in the stream dialect.
static AFTER_WHERE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"\b(GROUP\s+BY|HAVING|PARTITION\s+BY|EMIT|ORDER\s+BY|LIMIT|OFFSET|RETURNING|UNION|INTERSECT|EXCEPT)\b",
    )
});

fn pattern(p: &str) -> Regex {
    Regex::new(p).unwrap_or_else(|e| panic!("invalid built-in pattern {p}: {e}"))
}

/// AND-join predicates, parenthesising each one.
pub fn combine_predicates(predicates: &[String]) -> String {
    predicates
        .iter()
        .map(|p| format!("({})", p))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Splice `predicate` into the outermost WHERE clause of `sql`.
pub fn splice_predicate(sql: &str, predicate: &str) -> String {
    let trimmed = sql.trim_end();
    let (body, terminator) = match trimmed.strip_suffix(';') {
        Some(body) => (body.trim_end(), ";"),
        None => (trimmed, ""),
    };

    let scan = Scan::new(body);
    let search_from = scan.find_top_level(&FROM, 0).map(|m| m.end()).unwrap_or(0);

    let spliced = match scan.find_top_level(&WHERE, search_from) {
        Some(found) => {
            let cond_start = found.end();
            let cond_end = scan
                .find_top_level(&AFTER_WHERE, cond_start)
                .map(|m| m.start())
                .unwrap_or(body.len());
            let head = body[..found.start()].trim_end();
            let existing = body[cond_start..cond_end].trim();
            let tail = body[cond_end..].trim_start();
            join_parts(head, &format!("WHERE ({}) AND {}", existing, predicate), tail)
        }
        None => {
            let insert_at = scan
                .find_top_level(&AFTER_WHERE, search_from)
                .map(|m| m.start())
                .unwrap_or(body.len());
            let head = body[..insert_at].trim_end();
            let tail = body[insert_at..].trim_start();
            join_parts(head, &format!("WHERE {}", predicate), tail)
        }
    };

    format!("{}{}", spliced, terminator)
}

fn join_parts(head: &str, clause: &str, tail: &str) -> String {
    if tail.is_empty() {
        format!("{} {}", head, clause)
    } else {
        format!("{} {} {}", head, clause, tail)
    }
}

/// Words left unqualified when qualifying a predicate with an alias.
const SQL_WORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "BETWEEN", "CASE", "CAST", "DATE", "DESC", "DISTINCT",
    "ELSE", "END", "ESCAPE", "EXISTS", "FALSE", "ILIKE", "IN", "INTERVAL", "IS", "LIKE", "NOT",
    "NULL", "OR", "SIMILAR", "SOME", "THEN", "TIME", "TIMESTAMP", "TO", "TRUE", "UNKNOWN",
    "WHEN",
];

/// Prefix bare column references in `predicate` with `alias.`.
///
/// Literals, qualified names, function calls and SQL words are left alone.
/// Predicates holding a sub-select are returned unchanged since their inner
/// columns belong to another relation.
pub fn qualify_columns(predicate: &str, alias: &str) -> String {
    static SUBSELECT: LazyLock<Regex> = LazyLock::new(|| pattern(r"\bSELECT\b"));
    if SUBSELECT.is_match(Scan::new(predicate).text()) {
        return predicate.to_string();
    }

    let chars: Vec<char> = predicate.chars().collect();
    let mut out = String::with_capacity(predicate.len() + alias.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // Copy the literal, including doubled quotes.
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        out.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
        } else if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            i = (i + 1).min(chars.len());
            let preceded_by_dot = start > 0 && chars[start - 1] == '.';
            if !preceded_by_dot && chars.get(i) != Some(&'.') {
                out.push_str(alias);
                out.push('.');
            }
            out.extend(&chars[start..i]);
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                out.push(chars[i]);
                i += 1;
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let preceded_by_dot = start > 0 && chars[start - 1] == '.';
            let followed_by = chars[i..].iter().find(|c| !c.is_whitespace()).copied();
            let is_bare_column = !preceded_by_dot
                && followed_by != Some('.')
                && followed_by != Some('(')
                && !SQL_WORDS.contains(&word.to_ascii_uppercase().as_str());

            if is_bare_column {
                out.push_str(alias);
                out.push('.');
            }
            out.push_str(&word);
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_creates_where_clause() {
        assert_eq!(
            splice_predicate("SELECT * FROM orders;", "(tenant_id = 'A')"),
            "SELECT * FROM orders WHERE (tenant_id = 'A');"
        );
    }

    #[test]
    fn test_conjoins_with_existing_where() {
        assert_eq!(
            splice_predicate(
                "SELECT * FROM orders WHERE status = 'open' OR status = 'new' ORDER BY id LIMIT 5;",
                "(tenant_id = 'A')"
            ),
            "SELECT * FROM orders WHERE (status = 'open' OR status = 'new') AND (tenant_id = 'A') \
             ORDER BY id LIMIT 5;"
        );
    }

    #[test]
    fn test_inserts_before_trailing_clauses() {
        assert_eq!(
            splice_predicate(
                "SELECT region, COUNT(*) FROM pageviews WINDOW TUMBLING (SIZE 1 HOUR) \
                 GROUP BY region EMIT CHANGES;",
                "(tenant_id = 'A')"
            ),
            "SELECT region, COUNT(*) FROM pageviews WINDOW TUMBLING (SIZE 1 HOUR) \
             WHERE (tenant_id = 'A') GROUP BY region EMIT CHANGES;"
        );
    }

    #[test]
    fn test_ignores_nested_and_quoted_keywords() {
        assert_eq!(
            splice_predicate(
                "SELECT * FROM (SELECT * FROM t WHERE a = 1) x WHERE note = 'limit where'",
                "(x.tenant_id = 'A')"
            ),
            "SELECT * FROM (SELECT * FROM t WHERE a = 1) x WHERE (note = 'limit where') \
             AND (x.tenant_id = 'A')"
        );
    }

    #[test]
    fn test_update_and_delete() {
        assert_eq!(
            splice_predicate("UPDATE orders SET note = 'from' WHERE id = 1;", "(tenant_id = 'A')"),
            "UPDATE orders SET note = 'from' WHERE (id = 1) AND (tenant_id = 'A');"
        );
        assert_eq!(
            splice_predicate("DELETE FROM orders", "(tenant_id = 'A')"),
            "DELETE FROM orders WHERE (tenant_id = 'A')"
        );
    }

    #[test]
    fn test_combine_predicates_is_conjunction() {
        let combined =
            combine_predicates(&["tenantId = 'A'".to_string(), "role = 'user'".to_string()]);
        assert_eq!(combined, "(tenantId = 'A') AND (role = 'user')");
    }

    #[test]
    fn test_qualify_columns() {
        assert_eq!(
            qualify_columns("tenant_id = 'acme' AND owner IS NOT NULL", "o"),
            "o.tenant_id = 'acme' AND o.owner IS NOT NULL"
        );
        assert_eq!(
            qualify_columns("lower(email) = 'a''b' AND x.id > 10", "o"),
            "lower(o.email) = 'a''b' AND x.id > 10"
        );
        assert_eq!(
            qualify_columns("team IN (SELECT team FROM members)", "o"),
            "team IN (SELECT team FROM members)"
        );
    }
}
