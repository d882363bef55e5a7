//! # ripple-query
//!
//! Statement Builder for Ripple.
//!
//! Turns structured query descriptors into statement text for the stream
//! engine. Every literal is escaped; identifiers are validated against a
//! strict pattern. The only text spliced in verbatim is a predicate attached
//! with [`Filter::with_policy_predicate`], which the policy engine uses to
//! inject row-level security conditions.
//!
//! ```
//! use ripple_query::{Filter, OrderBy, QueryDescriptor};
//!
//! let sql = QueryDescriptor::select("orders")
//!     .fields(["id", "total"])
//!     .filter(Filter::new().eq("status", "open"))
//!     .order_by(OrderBy::desc("created_at"))
//!     .limit(10)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     sql,
//!     "SELECT id, total FROM orders WHERE status = 'open' ORDER BY created_at DESC LIMIT 10;"
//! );
//! ```

pub mod builder;
pub mod descriptor;
pub mod error;
pub mod value;

pub use builder::{
    build_delete, build_delete_all, build_insert, build_select, build_update, render_where,
    validate_identifier,
};
pub use descriptor::{
    Filter, Operator, OrderBy, OrderDirection, POLICY_PREDICATE_KEY, QueryDescriptor,
    WhereCondition,
};
pub use error::BuildError;
pub use value::{SqlValue, quote};
