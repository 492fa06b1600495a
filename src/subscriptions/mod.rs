//! Subscription dispatch and flow control.
//!
//! Every subscription owns a bounded queue of routed messages and one of
//! three delivery modes:
//! - Sync: the caller pulls with [`Subscription::next_message`]
//! - Async: a dedicated worker thread runs the message handler
//! - Channel: messages are pushed into a caller-owned channel
//!
//! Subscriptions support:
//! - Per-subscription pending limits (messages and bytes)
//! - Slow-consumer detection, reported once per episode
//! - Auto-unsubscribe after a message ceiling
//! - Drain, status observers and a closed handler
//!
//! # Example
//!
//! ```ignore
//! let (conn, _server) = Loopback::connect(ConnectionConfig::default(), Default::default())?;
//!
//! let sub = conn.subscribe_sync("updates")?;
//! sub.set_pending_limits(1000, 1024 * 1024)?;
//! sub.set_auto_unsubscribe(10)?;
//!
//! conn.publish("updates", b"hello")?;
//! let msg = sub.next_message(Duration::from_secs(1))?;
//! ```

pub(crate) mod dispatch;
pub mod queue;
mod registry;
pub mod status;
pub(crate) mod subscription;
mod types;

pub use queue::{PendingLimits, DEFAULT_PENDING_BYTES_LIMIT, DEFAULT_PENDING_MSGS_LIMIT, UNLIMITED};
pub(crate) use registry::Registry;
pub use status::SubscriptionStatus;
pub use subscription::Subscription;
pub use types::{CloseReason, SubscriptionMode, SubscriptionStats};
