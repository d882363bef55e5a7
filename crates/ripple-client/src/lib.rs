//! # ripple-client
//!
//! Query execution for Ripple.
//!
//! - [`QueryClient`] sends statements to the engine over HTTP. Pull queries
//!   read the whole newline-delimited JSON body; push queries keep it open
//!   and hand rows to [`PushCallbacks`] as they arrive.
//! - [`StreamingQueryHandle`] observes and stops a push query.
//! - [`Ripple`] ties the statement builder, the policy engine and the client
//!   together so every request is checked before it is sent.
//!
//! ```no_run
//! use ripple_client::{PushCallbacks, Ripple};
//! use ripple_core::{ExecutionContext, RippleConfig};
//! use ripple_query::{Filter, QueryDescriptor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ripple = Ripple::from_config(&RippleConfig::from_file("ripple.yaml")?)?;
//! let ctx = ExecutionContext::new("user-1", "acme", "user");
//!
//! let orders = ripple
//!     .select(
//!         &QueryDescriptor::select("orders").filter(Filter::new().eq("status", "open")),
//!         &ctx,
//!     )
//!     .await?;
//! println!("{} open orders", orders.row_count());
//!
//! let handle = ripple
//!     .stream_select(
//!         &QueryDescriptor::select("pageviews"),
//!         &ctx,
//!         PushCallbacks::new().on_row(|row| async move { println!("{row:?}") }),
//!     )
//!     .await?;
//! handle.terminate().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod facade;
pub mod protocol;
pub mod row;
pub mod stream;

pub use client::QueryClient;
pub use error::{ClientError, ErrorKind};
pub use facade::Ripple;
pub use protocol::{BackendError, LineBuffer, QueryHeader, StreamFrame, parse_line};
pub use row::{QueryResult, Row};
pub use stream::{PushCallbacks, QueryState, StreamingQueryHandle};
