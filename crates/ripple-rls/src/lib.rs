//! # ripple-rls
//!
//! Statement analysis and Row-Level Security (RLS) for Ripple.
//!
//! The [`PolicyEngine`] holds access policies and rewrites statements under
//! an [`ExecutionContext`](ripple_core::ExecutionContext):
//!
//! **Before:**
//! ```sql
//! SELECT * FROM orders WHERE status = 'pending';
//! ```
//!
//! **After** (policy `tenant_id = auth.tenant_id()`, tenant `acme`):
//! ```sql
//! SELECT * FROM orders WHERE (status = 'pending') AND (tenant_id = 'acme');
//! ```
//!
//! ## Rules
//!
//! | Statement | Behaviour |
//! |-----------|-----------|
//! | `SELECT` / `UPDATE` / `DELETE` | Predicates of every matching policy are AND-joined into the outer WHERE |
//! | `INSERT` | A matching policy must exist; the statement is not rewritten |
//! | `CREATE` / `DROP` / `ALTER` / `TRUNCATE` | Requires an elevated role |
//! | Anything else | Passed through |
//!
//! A table with RLS enabled and no applicable policy is denied (fail-closed).

pub mod engine;
pub mod error;
pub mod injector;
pub mod parser;
pub mod policy;
mod scan;

pub use engine::{PolicyEngine, RewriteOutcome, TableScope};
pub use error::RlsError;
pub use parser::{StatementAnalysis, StatementAnalyzer, StatementKind, TableReference};
pub use policy::{Policy, TablePattern};
