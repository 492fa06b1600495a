//! # subflow
//!
//! Client-side subscription dispatch and flow control for a pub/sub client.
//!
//! ## Core Concepts
//!
//! - **Connection**: Owns the subscription registry and talks to a transport
//! - **Subscription**: Bounded queue plus a Sync, Async or Channel delivery mode
//! - **Slow consumer**: Messages past the pending limits are dropped and
//!   reported once per episode
//! - **Status**: Active, SlowConsumer, Draining and Closed, with observers
//!
//! ## Example
//!
//! ```ignore
//! use subflow::{ConnectionConfig, Loopback};
//!
//! let (conn, _server) = Loopback::connect(ConnectionConfig::default(), Default::default())?;
//!
//! conn.set_error_handler(|_, sub, err| eprintln!("async error on {sub:?}: {err}"));
//!
//! let sub = conn.subscribe("orders", |msg| {
//!     println!("got {} bytes", msg.payload.len());
//! })?;
//! sub.set_auto_unsubscribe(100)?;
//!
//! conn.publish("orders", b"hello")?;
//! ```

pub mod connection;
pub mod error;
pub mod notify;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionConfig, Inbound};
pub use error::{Result, SubError};
pub use notify::ErrorHandler;
pub use subscriptions::{
    CloseReason, PendingLimits, Subscription, SubscriptionMode, SubscriptionStats,
    SubscriptionStatus, DEFAULT_PENDING_BYTES_LIMIT, DEFAULT_PENDING_MSGS_LIMIT, UNLIMITED,
};
pub use transport::{Loopback, LoopbackConfig, Transport};
pub use types::{Message, SubscriptionId};
