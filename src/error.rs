//! Error types for subscription dispatch.

use thiserror::Error;

/// Main error type for subscription and connection operations.
///
/// Errors are `Clone` so a permission denial can be latched on a
/// subscription and the last asynchronous error kept on the connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubError {
    #[error("invalid subscription")]
    BadSubscription,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("maximum messages delivered")]
    MaxMessagesReached,

    #[error("timeout")]
    Timeout,

    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    #[error("permissions violation: {0}")]
    PermissionViolation(String),

    #[error("server maximum subscriptions exceeded")]
    MaxSubscriptionsExceeded,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("illegal call on a non-synchronous subscription")]
    SyncSubscriptionRequired,

    #[error("invalid subscription type")]
    WrongSubscriptionType,

    #[error("drain did not complete before timeout")]
    DrainTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl From<std::io::Error> for SubError {
    fn from(e: std::io::Error) -> Self {
        SubError::Spawn(e.to_string())
    }
}

impl SubError {
    /// True for errors raised outside any caller's stack and routed to the
    /// connection-wide error handler.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            SubError::SlowConsumer
                | SubError::PermissionViolation(_)
                | SubError::MaxSubscriptionsExceeded
                | SubError::DrainTimeout
        )
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SubError::BadSubscription.to_string(), "invalid subscription");
        assert_eq!(
            SubError::PermissionViolation("subscribe to \"foo\"".into()).to_string(),
            "permissions violation: subscribe to \"foo\""
        );
    }

    #[test]
    fn test_async_classification() {
        assert!(SubError::SlowConsumer.is_async());
        assert!(SubError::MaxSubscriptionsExceeded.is_async());
        assert!(!SubError::Timeout.is_async());
        assert!(!SubError::InvalidArgument("x".into()).is_async());
    }
}
