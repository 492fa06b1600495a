//! Bounded per-subscription delivery queue.
//!
//! The queue enforces two independent caps (message count and total payload
//! bytes) and tracks slow-consumer episodes: an episode starts with the first
//! drop while not already over limit and ends once occupancy falls back below
//! both caps.

use crate::error::{Result, SubError};
use crate::types::Message;
use std::collections::VecDeque;

/// Default maximum number of pending messages per subscription.
pub const DEFAULT_PENDING_MSGS_LIMIT: i64 = 512 * 1024;

/// Default maximum number of pending payload bytes per subscription (64MB).
pub const DEFAULT_PENDING_BYTES_LIMIT: i64 = 64 * 1024 * 1024;

/// Sentinel disabling one limit dimension.
pub const UNLIMITED: i64 = -1;

/// Message-count and byte-size caps for a delivery queue.
///
/// Each dimension is either positive or negative (unlimited). Zero is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingLimits {
    msgs: i64,
    bytes: i64,
}

impl PendingLimits {
    pub fn new(msgs: i64, bytes: i64) -> Result<Self> {
        if msgs == 0 || bytes == 0 {
            return Err(SubError::InvalidArgument(format!(
                "pending limits must be positive or {UNLIMITED}, got ({msgs}, {bytes})"
            )));
        }
        Ok(Self { msgs, bytes })
    }

    pub fn msgs(&self) -> i64 {
        self.msgs
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    fn msgs_bound(&self) -> Option<usize> {
        (self.msgs > 0).then_some(self.msgs as usize)
    }

    fn bytes_bound(&self) -> Option<usize> {
        (self.bytes > 0).then_some(self.bytes as usize)
    }

    fn exceeded_by(&self, msgs: usize, bytes: usize) -> bool {
        self.msgs_bound().is_some_and(|max| msgs > max)
            || self.bytes_bound().is_some_and(|max| bytes > max)
    }

    fn below(&self, msgs: usize, bytes: usize) -> bool {
        self.msgs_bound().map_or(true, |max| msgs < max)
            && self.bytes_bound().map_or(true, |max| bytes < max)
    }
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self {
            msgs: DEFAULT_PENDING_MSGS_LIMIT,
            bytes: DEFAULT_PENDING_BYTES_LIMIT,
        }
    }
}

/// Outcome of offering a message to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Dropped for lack of room. `episode_start` is set only for the first
    /// drop of a slow-consumer episode.
    Dropped { episode_start: bool },
}

/// FIFO of pending messages with occupancy accounting.
///
/// Occupancy counts queued messages plus any message taken for delivery but
/// not yet released, so a callback that is still running holds its slot.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    items: VecDeque<Message>,
    limits: PendingLimits,
    pending_msgs: usize,
    pending_bytes: usize,
    max_pending_msgs: usize,
    max_pending_bytes: usize,
    dropped: u64,
    over_limit: bool,
}

impl DeliveryQueue {
    pub fn new(limits: PendingLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    /// Append `msg` unless either cap would be exceeded.
    pub fn push(&mut self, msg: Message) -> Admission {
        let size = msg.size();
        let msgs = self.pending_msgs + 1;
        let bytes = self.pending_bytes + size;

        if self.limits.exceeded_by(msgs, bytes) {
            return Admission::Dropped {
                episode_start: self.note_overflow(),
            };
        }

        self.items.push_back(msg);
        self.pending_msgs = msgs;
        self.pending_bytes = bytes;
        self.max_pending_msgs = self.max_pending_msgs.max(msgs);
        self.max_pending_bytes = self.max_pending_bytes.max(bytes);
        Admission::Queued
    }

    /// Pop the head and release its accounting at once.
    ///
    /// Returns the message and whether this ended a slow-consumer episode.
    pub fn pop(&mut self) -> Option<(Message, bool)> {
        let msg = self.take()?;
        let ended = self.release(msg.size());
        Some((msg, ended))
    }

    /// Pop the head but keep it counted until [`release`](Self::release).
    pub fn take(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    /// Release the accounting of a message previously taken.
    ///
    /// Returns true if this ended a slow-consumer episode.
    pub fn release(&mut self, size: usize) -> bool {
        self.pending_msgs = self.pending_msgs.saturating_sub(1);
        self.pending_bytes = self.pending_bytes.saturating_sub(size);
        if self.over_limit && self.limits.below(self.pending_msgs, self.pending_bytes) {
            self.over_limit = false;
            return true;
        }
        false
    }

    /// Count a drop caused by an external bound (e.g. a full channel).
    ///
    /// Returns true for the first drop of an episode.
    pub fn note_overflow(&mut self) -> bool {
        self.dropped += 1;
        let start = !self.over_limit;
        self.over_limit = true;
        start
    }

    /// End an episode after an externally bounded delivery succeeded.
    pub fn end_episode(&mut self) -> bool {
        std::mem::replace(&mut self.over_limit, false)
    }

    /// Count a drop that does not belong to a slow-consumer episode.
    pub fn note_discard(&mut self) {
        self.dropped += 1;
    }

    /// Discard everything queued. In-flight accounting is reset as well.
    pub fn clear(&mut self) {
        self.items.clear();
        self.pending_msgs = 0;
        self.pending_bytes = 0;
        self.over_limit = false;
    }

    /// Replace the limits. Returns true if this ended a slow-consumer episode.
    pub fn set_limits(&mut self, limits: PendingLimits) -> bool {
        self.limits = limits;
        if self.over_limit && limits.below(self.pending_msgs, self.pending_bytes) {
            self.over_limit = false;
            return true;
        }
        false
    }

    pub fn limits(&self) -> PendingLimits {
        self.limits
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.pending_msgs, self.pending_bytes)
    }

    pub fn max_pending(&self) -> (usize, usize) {
        (self.max_pending_msgs, self.max_pending_bytes)
    }

    pub fn clear_max_pending(&mut self) {
        self.max_pending_msgs = 0;
        self.max_pending_bytes = 0;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending_msgs == 0
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_over_limit(&self) -> bool {
        self.over_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(len: usize) -> Message {
        Message::new("foo", vec![0u8; len])
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(matches!(
            PendingLimits::new(0, 1),
            Err(SubError::InvalidArgument(_))
        ));
        assert!(matches!(
            PendingLimits::new(1, 0),
            Err(SubError::InvalidArgument(_))
        ));
        assert!(PendingLimits::new(UNLIMITED, 10).is_ok());
        assert!(PendingLimits::new(10, UNLIMITED).is_ok());
    }

    #[test]
    fn test_saturation_counts() {
        let mut q = DeliveryQueue::new(PendingLimits::new(10, 1024).unwrap());

        let mut starts = 0;
        for _ in 0..100 {
            if let Admission::Dropped { episode_start: true } = q.push(msg(5)) {
                starts += 1;
            }
        }

        assert_eq!(q.pending(), (10, 50));
        assert_eq!(q.dropped(), 90);
        assert_eq!(starts, 1);
        assert_eq!(q.max_pending(), (10, 50));
    }

    #[test]
    fn test_byte_limit_only() {
        let mut q = DeliveryQueue::new(PendingLimits::new(UNLIMITED, 250).unwrap());
        for _ in 0..100 {
            q.push(msg(5));
        }
        assert_eq!(q.pending(), (50, 250));
        assert_eq!(q.dropped(), 50);
    }

    #[test]
    fn test_episode_rearms_after_drain() {
        let mut q = DeliveryQueue::new(PendingLimits::new(2, UNLIMITED).unwrap());
        q.push(msg(1));
        q.push(msg(1));
        assert_eq!(q.push(msg(1)), Admission::Dropped { episode_start: true });
        assert_eq!(q.push(msg(1)), Admission::Dropped { episode_start: false });

        let (_, ended) = q.pop().unwrap();
        assert!(ended);
        assert!(!q.is_over_limit());

        assert_eq!(q.push(msg(1)), Admission::Queued);
        assert_eq!(q.push(msg(1)), Admission::Dropped { episode_start: true });
        assert_eq!(q.dropped(), 3);
    }

    #[test]
    fn test_in_flight_holds_slot() {
        let mut q = DeliveryQueue::new(PendingLimits::new(2, UNLIMITED).unwrap());
        q.push(msg(3));
        let taken = q.take().unwrap();
        assert_eq!(q.pending(), (1, 3));

        q.push(msg(3));
        assert!(matches!(q.push(msg(3)), Admission::Dropped { .. }));

        q.release(taken.size());
        assert_eq!(q.pending(), (1, 3));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_clear_max_pending() {
        let mut q = DeliveryQueue::new(PendingLimits::default());
        q.push(msg(10));
        q.push(msg(10));
        q.pop();
        assert_eq!(q.max_pending(), (2, 20));
        q.clear_max_pending();
        assert_eq!(q.max_pending(), (0, 0));
        assert_eq!(q.pending(), (1, 10));
    }

    proptest! {
        #[test]
        fn prop_occupancy_matches_contents(
            ops in proptest::collection::vec((any::<bool>(), 0usize..64), 1..200),
            max_msgs in 1i64..20,
            max_bytes in 1i64..400,
        ) {
            let mut q = DeliveryQueue::new(PendingLimits::new(max_msgs, max_bytes).unwrap());
            let mut offered = 0u64;
            let mut popped = 0u64;

            for (is_push, len) in ops {
                if is_push {
                    offered += 1;
                    q.push(msg(len));
                } else if q.pop().is_some() {
                    popped += 1;
                }

                let (msgs, bytes) = q.pending();
                let actual: usize = q.items.iter().map(Message::size).sum();
                prop_assert_eq!(msgs, q.len());
                prop_assert_eq!(bytes, actual);
                prop_assert!(msgs as i64 <= max_msgs);
                prop_assert!(bytes as i64 <= max_bytes);
            }

            prop_assert_eq!(offered, q.dropped() + popped + q.len() as u64);
        }
    }
}
