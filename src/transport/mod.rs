//! Outbound side of the wire collaborator.
//!
//! The engine never frames or parses protocol traffic itself. It asks a
//! [`Transport`] to subscribe, unsubscribe, publish and flush, and the
//! transport feeds inbound traffic back through
//! [`Inbound`](crate::connection::Inbound).

pub mod loopback;

use crate::error::Result;
use crate::types::SubscriptionId;

pub use loopback::{Loopback, LoopbackConfig};

/// Protocol requests issued by the engine.
///
/// Implementations must not call back into [`Inbound`](crate::connection::Inbound)
/// while holding a lock that `unsubscribe` or `publish` also takes.
pub trait Transport: Send + Sync {
    /// Register interest in `subject` under `sid`.
    ///
    /// A server-side refusal is reported asynchronously, not as an error here.
    fn subscribe(&self, sid: SubscriptionId, subject: &str, queue_group: Option<&str>) -> Result<()>;

    /// Remove interest, now (`None`) or after `max` total deliveries.
    fn unsubscribe(&self, sid: SubscriptionId, max: Option<u64>) -> Result<()>;

    fn publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<()>;

    /// Return once the server has processed every request sent so far.
    fn flush(&self) -> Result<()>;

    fn close(&self);
}
