//! Registry mapping subscription ids to live subscriptions.

use crate::types::SubscriptionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::subscription::Subscription;

/// Live subscriptions of one connection.
///
/// Lookups take a read lock and clone the handle out, so routing never
/// holds the registry lock while touching a subscription.
pub struct Registry {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh id. Ids are never reused within a registry.
    pub fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn register(&self, sub: Subscription) -> SubscriptionId {
        let id = sub.id();
        self.subscriptions.write().insert(id, sub);
        id
    }

    pub fn lookup(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().remove(&id)
    }

    /// Remove and return every subscription.
    pub fn drain(&self) -> Vec<Subscription> {
        self.subscriptions.write().drain().map(|(_, sub)| sub).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::queue::PendingLimits;
    use crate::subscriptions::subscription::Delivery;
    use std::sync::Weak;

    fn detached(registry: &Registry, subject: &str) -> Subscription {
        Subscription::new(
            registry.allocate_id(),
            subject.to_string(),
            None,
            &Delivery::Sync,
            PendingLimits::default(),
            10,
            Weak::new(),
        )
    }

    #[test]
    fn test_register_lookup_remove() {
        let registry = Registry::new();
        let sub = detached(&registry, "foo");
        let id = registry.register(sub.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(id), Some(sub));

        assert!(registry.remove(id).is_some());
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_drain() {
        let registry = Registry::new();
        for subject in ["a", "b", "c"] {
            registry.register(detached(&registry, subject));
        }
        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
    }
}
