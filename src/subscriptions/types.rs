//! Subscription types.

use crate::error::SubError;
use crate::types::SubscriptionId;
use serde::{Deserialize, Serialize};

use super::status::SubscriptionStatus;

/// How messages reach the application. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Pulled with `Subscription::next_message`.
    Sync,
    /// Pushed to a handler on a dedicated worker thread.
    Async,
    /// Pushed into a caller-owned channel.
    Channel,
}

/// Why a subscription closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Unsubscribed,
    MaxMessages,
    Drained,
    DrainTimeout,
    ConnectionClosed,
}

impl CloseReason {
    /// Error returned to a synchronous reader of a subscription closed this way.
    pub(crate) fn read_error(self) -> SubError {
        match self {
            CloseReason::MaxMessages => SubError::MaxMessagesReached,
            _ => SubError::BadSubscription,
        }
    }

    /// Whether closing this way should tell the server to stop delivering.
    pub(crate) fn needs_unsubscribe(self) -> bool {
        matches!(
            self,
            CloseReason::Unsubscribed | CloseReason::MaxMessages | CloseReason::DrainTimeout
        )
    }
}

/// Point-in-time snapshot of a subscription's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub subject: String,
    pub queue_group: Option<String>,
    pub mode: SubscriptionMode,
    pub status: SubscriptionStatus,
    pub delivered: u64,
    pub dropped: u64,
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    /// Auto-unsubscribe ceiling, if any.
    pub max: Option<u64>,
}
