//! Subscription status machine and best-effort status observers.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    SlowConsumer,
    Draining,
    Closed,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::SlowConsumer,
        SubscriptionStatus::Draining,
        SubscriptionStatus::Closed,
    ];

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Active, SlowConsumer) | (SlowConsumer, Active) => true,
            (Active | SlowConsumer, Draining) => true,
            _ => false,
        }
    }

    pub fn is_closed(self) -> bool {
        self == SubscriptionStatus::Closed
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::SlowConsumer => "slow_consumer",
            SubscriptionStatus::Draining => "draining",
            SubscriptionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Observer {
    sender: Sender<SubscriptionStatus>,
    filter: Vec<SubscriptionStatus>,
}

impl Observer {
    fn wants(&self, status: SubscriptionStatus) -> bool {
        self.filter.contains(&status)
    }

    /// Non-blocking send. Intermediate statuses leave the last slot free so
    /// `Closed` always fits. Returns false once the receiver is gone.
    fn offer(&self, status: SubscriptionStatus) -> bool {
        if !status.is_closed() {
            let capacity = self.sender.capacity().unwrap_or(usize::MAX);
            if self.sender.len() + 1 >= capacity {
                return true;
            }
        }
        !matches!(
            self.sender.try_send(status),
            Err(TrySendError::Disconnected(_))
        )
    }
}

/// Current status plus the observers attached to it.
pub struct StatusMachine {
    current: SubscriptionStatus,
    observers: Vec<Observer>,
    buffer: usize,
}

impl StatusMachine {
    /// `buffer` is the per-observer channel capacity (at least 2).
    pub fn new(buffer: usize) -> Self {
        Self {
            current: SubscriptionStatus::Active,
            observers: Vec::new(),
            buffer: buffer.max(2),
        }
    }

    pub fn current(&self) -> SubscriptionStatus {
        self.current
    }

    /// Move to `next` if legal. Returns whether the status changed.
    pub fn transition(&mut self, next: SubscriptionStatus) -> bool {
        if !self.current.can_transition_to(next) {
            return false;
        }
        self.current = next;
        self.observers
            .retain(|obs| !obs.wants(next) || obs.offer(next));
        if next.is_closed() {
            // Dropping the senders disconnects every observer after Closed.
            self.observers.clear();
        }
        true
    }

    /// Attach an observer for the given statuses (all when `filter` is empty).
    ///
    /// The current status is sent right away if it matches the filter.
    pub fn observe(&mut self, filter: &[SubscriptionStatus]) -> Receiver<SubscriptionStatus> {
        let filter = if filter.is_empty() {
            SubscriptionStatus::ALL.to_vec()
        } else {
            filter.to_vec()
        };
        let (sender, receiver) = bounded(self.buffer);
        let observer = Observer { sender, filter };

        if observer.wants(self.current) {
            observer.offer(self.current);
        }
        if !self.current.is_closed() {
            self.observers.push(observer);
        }
        receiver
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn test_transitions() {
        assert!(Active.can_transition_to(SlowConsumer));
        assert!(SlowConsumer.can_transition_to(Active));
        assert!(SlowConsumer.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));
        assert!(!Draining.can_transition_to(SlowConsumer));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_observer_sees_initial_and_changes() {
        let mut machine = StatusMachine::new(10);
        let rx = machine.observe(&[]);

        machine.transition(SlowConsumer);
        machine.transition(Draining);
        machine.transition(Closed);

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen, vec![Active, SlowConsumer, Draining, Closed]);
        assert_eq!(machine.observer_count(), 0);
    }

    #[test]
    fn test_filtered_observer() {
        let mut machine = StatusMachine::new(10);
        let rx = machine.observe(&[SlowConsumer]);

        machine.transition(SlowConsumer);
        machine.transition(Active);
        machine.transition(SlowConsumer);

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen, vec![SlowConsumer, SlowConsumer]);
    }

    #[test]
    fn test_unread_observer_never_blocks_and_gets_closed() {
        let mut machine = StatusMachine::new(4);
        let rx = machine.observe(&[]);

        for _ in 0..100 {
            machine.transition(SlowConsumer);
            machine.transition(Active);
        }
        machine.transition(Closed);

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last(), Some(&Closed));
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let mut machine = StatusMachine::new(10);
        drop(machine.observe(&[]));
        machine.transition(SlowConsumer);
        assert_eq!(machine.observer_count(), 0);
    }

    #[test]
    fn test_observe_after_close() {
        let mut machine = StatusMachine::new(10);
        machine.transition(Closed);
        let rx = machine.observe(&[]);
        assert_eq!(rx.try_recv(), Ok(Closed));
        assert!(rx.recv().is_err());
    }
}
