//! Compiled policies.

use regex::Regex;
use ripple_core::{ExecutionContext, PolicyDefinition, PolicyOperation};
use ripple_query::quote;
use std::sync::LazyLock;

use crate::error::RlsError;

static CONTEXT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bauth\.(uid|tenant_id|role|email)\(\s*\)")
        .unwrap_or_else(|e| panic!("invalid token pattern: {e}"))
});

/// Table pattern of a policy.
#[derive(Debug, Clone)]
pub enum TablePattern {
    /// `*`
    Any,
    /// Exact name, compared case-insensitively.
    Exact(String),
    /// `prefix_*`, `*_suffix` and other globs.
    Glob(Regex),
}

impl TablePattern {
    /// Compile a pattern as written in a policy definition.
    pub fn parse(pattern: &str) -> Result<Self, RlsError> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Ok(TablePattern::Any);
        }
        if !pattern.contains('*') {
            return Ok(TablePattern::Exact(pattern.to_ascii_lowercase()));
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Regex::new(&format!("(?i)^{}$", body))
            .map(TablePattern::Glob)
            .map_err(|e| RlsError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Whether `table` matches. Schema-qualified names also match on their
    /// unqualified part.
    pub fn matches(&self, table: &str) -> bool {
        let short = unqualified(table);
        match self {
            TablePattern::Any => true,
            TablePattern::Exact(name) => {
                table.eq_ignore_ascii_case(name) || short.eq_ignore_ascii_case(name)
            }
            TablePattern::Glob(re) => re.is_match(table) || re.is_match(short),
        }
    }
}

pub(crate) fn unqualified(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// A registered policy.
#[derive(Debug, Clone)]
pub struct Policy {
    definition: PolicyDefinition,
    pattern: TablePattern,
}

impl Policy {
    /// Compile a definition.
    pub fn compile(definition: PolicyDefinition) -> Result<Self, RlsError> {
        let pattern = TablePattern::parse(&definition.table)?;
        Ok(Self {
            definition,
            pattern,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &PolicyDefinition {
        &self.definition
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.definition.enabled = enabled;
    }

    /// Whether the policy is enabled and covers `table`.
    pub fn targets(&self, table: &str) -> bool {
        self.definition.enabled && self.pattern.matches(table)
    }

    /// Whether the policy applies to a statement of kind `operation` on
    /// `table`, run by `ctx`.
    pub fn applies(&self, table: &str, operation: PolicyOperation, ctx: &ExecutionContext) -> bool {
        self.targets(table)
            && self.definition.operation.covers(operation)
            && ctx.has_any_role(&self.definition.roles)
    }

    /// Condition with context tokens replaced by quoted literals, or `None`
    /// when it reduces to an always-true predicate.
    pub fn render(&self, ctx: &ExecutionContext) -> Option<String> {
        let rendered = substitute_tokens(&self.definition.condition, ctx);
        if is_trivial(&rendered) {
            None
        } else {
            Some(rendered.trim().to_string())
        }
    }
}

/// Replace `auth.uid()`, `auth.tenant_id()`, `auth.role()` and
/// `auth.email()` with escaped literals from `ctx`.
pub fn substitute_tokens(template: &str, ctx: &ExecutionContext) -> String {
    CONTEXT_TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
            match token.as_deref() {
                Some("uid") => quote(&ctx.subject_id),
                Some("tenant_id") => quote(&ctx.tenant_id),
                Some("role") => quote(&ctx.role),
                Some("email") => ctx
                    .email
                    .as_deref()
                    .map(quote)
                    .unwrap_or_else(|| "NULL".to_string()),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Whether a predicate is always true.
pub fn is_trivial(predicate: &str) -> bool {
    let mut p = predicate.trim();
    while let Some(inner) = p.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        p = inner.trim();
    }
    let compact: String = p.chars().filter(|c| !c.is_whitespace()).collect();
    compact.is_empty() || compact.eq_ignore_ascii_case("true") || compact == "1=1"
}
