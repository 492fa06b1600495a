//! Core types shared by the connection and its subscriptions.

use crate::connection::{Connection, Shared};
use crate::error::{Result, SubError};
use crate::subscriptions::subscription::Inner;
use crate::subscriptions::Subscription;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;

/// Unique identifier for a subscription within one connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message routed to a subscription.
///
/// Carries weak back-references to the subscription that delivered it and
/// to the originating connection, so handlers can adjust the subscription
/// or reply without keeping either alive.
#[derive(Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
    pub(crate) sub: Weak<Inner>,
    pub(crate) conn: Weak<Shared>,
}

impl Message {
    /// Build a detached message (not tied to any connection).
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            sub: Weak::new(),
            conn: Weak::new(),
        }
    }

    /// Size used for pending-bytes accounting.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The subscription this message was delivered on, if it still exists.
    pub fn subscription(&self) -> Option<Subscription> {
        self.sub.upgrade().map(Subscription::from_inner)
    }

    /// Publish `payload` to this message's reply subject.
    ///
    /// Works after the delivering subscription has been closed, as long as
    /// the connection is still open.
    pub fn respond(&self, payload: &[u8]) -> Result<()> {
        let reply = self
            .reply
            .as_deref()
            .ok_or_else(|| SubError::InvalidArgument("message has no reply subject".into()))?;
        let shared = self.conn.upgrade().ok_or(SubError::ConnectionClosed)?;
        Connection::from_shared(shared).publish(reply, payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("size", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_message() {
        let msg = Message::new("foo", b"hello".to_vec());
        assert_eq!(msg.size(), 5);
        assert!(msg.subscription().is_none());
        assert_eq!(
            msg.respond(b"x"),
            Err(SubError::InvalidArgument("message has no reply subject".into()))
        );
    }

    #[test]
    fn test_respond_without_connection() {
        let mut msg = Message::new("foo", Vec::new());
        msg.reply = Some("_INBOX.1".into());
        assert_eq!(msg.respond(b"x"), Err(SubError::ConnectionClosed));
    }

    #[test]
    fn test_sid_format() {
        assert_eq!(format!("{:?}", SubscriptionId(7)), "Sid(7)");
        assert_eq!(SubscriptionId(7).to_string(), "7");
    }
}
