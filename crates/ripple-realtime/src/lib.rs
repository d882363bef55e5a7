//! # ripple-realtime
//!
//! Publish/subscribe channels over a persistent socket.
//!
//! A [`RealtimeClient`] hands out one [`Channel`] per topic. Listeners for
//! table changes, streams, broadcasts and presence can be registered before
//! or after connecting; they are announced to the server on connect and
//! announced again after every reconnect.
//!
//! ```no_run
//! use ripple_core::RealtimeConfig;
//! use ripple_realtime::{ChangeFilter, LifecycleEvent, RealtimeClient};
//!
//! # async fn example() -> Result<(), ripple_realtime::RealtimeError> {
//! let client = RealtimeClient::new(RealtimeConfig::default());
//! let orders = client.channel("orders")?;
//!
//! orders.on_table_changes("orders", ChangeFilter::Insert, Some("status=eq.open"), |event| {
//!     println!("{event:?}");
//! })?;
//! orders.on_lifecycle(|event| {
//!     if let LifecycleEvent::Error { terminal: true, message } = event {
//!         eprintln!("realtime gave up: {message}");
//!     }
//! });
//!
//! orders.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod connector;
pub mod error;
pub mod event;
pub mod frame;
pub mod subscription;

pub use channel::{Channel, ChannelState, Presence};
pub use client::RealtimeClient;
pub use connector::{Connector, Transport, WebSocketConnector};
pub use error::RealtimeError;
pub use event::{ChangeKind, LifecycleEvent, RealtimeEvent};
pub use frame::{Frame, FrameType};
pub use subscription::{ChangeFilter, ColumnFilter, FilterOp, Subscription, SubscriptionKind};
