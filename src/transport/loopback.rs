//! In-memory transport that plays the server's part in one process.
//!
//! Routes published messages to subscriptions with an identical subject,
//! picks one member per queue group in round-robin order, honours
//! server-side auto-unsubscribe, and can be configured to deny subjects or
//! cap the number of subscriptions.

use crate::connection::{Connection, ConnectionConfig, Inbound};
use crate::error::{Result, SubError};
use crate::types::SubscriptionId;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::Transport;

/// Server-side behaviour of the loopback.
#[derive(Clone, Debug, Default)]
pub struct LoopbackConfig {
    /// Subjects the server refuses to subscribe to.
    pub deny_subscribe: Vec<String>,
    /// Maximum live subscriptions; further subscribes are rejected.
    pub max_subscriptions: Option<usize>,
}

struct Route {
    subject: String,
    queue_group: Option<String>,
    max: Option<u64>,
    sent: u64,
}

#[derive(Default)]
struct Routes {
    /// Ordered by sid so queue-group rotation is deterministic.
    by_sid: BTreeMap<SubscriptionId, Route>,
    /// Next member index per (subject, queue group).
    cursors: HashMap<(String, String), usize>,
}

impl Routes {
    /// Pick the recipients of a message on `subject` and count the send.
    fn select(&mut self, subject: &str) -> Vec<SubscriptionId> {
        let mut targets = Vec::new();
        let mut groups: BTreeMap<&str, Vec<SubscriptionId>> = BTreeMap::new();

        for (sid, route) in &self.by_sid {
            if route.subject != subject {
                continue;
            }
            match &route.queue_group {
                Some(group) => groups.entry(group.as_str()).or_default().push(*sid),
                None => targets.push(*sid),
            }
        }

        for (group, members) in groups {
            let cursor = self
                .cursors
                .entry((subject.to_string(), group.to_string()))
                .or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        for sid in &targets {
            let finished = match self.by_sid.get_mut(sid) {
                Some(route) => {
                    route.sent += 1;
                    route.max.is_some_and(|max| route.sent >= max)
                }
                None => false,
            };
            if finished {
                self.by_sid.remove(sid);
            }
        }
        targets
    }
}

/// Loopback transport. Create with [`Loopback::connect`].
pub struct Loopback {
    config: LoopbackConfig,
    inbound: RwLock<Option<Inbound>>,
    routes: Mutex<Routes>,
    closed: AtomicBool,
}

impl Loopback {
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inbound: RwLock::new(None),
            routes: Mutex::new(Routes::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Build a connection wired to a fresh loopback.
    pub fn connect(
        config: ConnectionConfig,
        loopback: LoopbackConfig,
    ) -> Result<(Connection, Arc<Loopback>)> {
        let transport = Loopback::new(loopback);
        let conn = Connection::new(config, transport.clone())?;
        transport.attach(conn.inbound());
        Ok((conn, transport))
    }

    /// Set the engine entry point inbound traffic is delivered to.
    pub fn attach(&self, inbound: Inbound) {
        *self.inbound.write() = Some(inbound);
    }

    /// Number of subscriptions the server side still routes to.
    pub fn route_count(&self) -> usize {
        self.routes.lock().by_sid.len()
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        self.close();
        if let Some(inbound) = self.inbound() {
            inbound.connection_closed();
        }
    }

    fn inbound(&self) -> Option<Inbound> {
        self.inbound.read().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Transport for Loopback {
    fn subscribe(&self, sid: SubscriptionId, subject: &str, queue_group: Option<&str>) -> Result<()> {
        self.check_open()?;

        if self.config.deny_subscribe.iter().any(|s| s == subject) {
            debug!(sid = %sid, subject, "subscription denied");
            if let Some(inbound) = self.inbound() {
                inbound.permission_denied(
                    sid,
                    format!("Permissions Violation for Subscription to \"{subject}\""),
                );
            }
            return Ok(());
        }

        let accepted = {
            let mut routes = self.routes.lock();
            let full = self
                .config
                .max_subscriptions
                .is_some_and(|max| routes.by_sid.len() >= max);
            if !full {
                routes.by_sid.insert(
                    sid,
                    Route {
                        subject: subject.to_string(),
                        queue_group: queue_group.map(str::to_string),
                        max: None,
                        sent: 0,
                    },
                );
            }
            !full
        };

        if !accepted {
            debug!(sid = %sid, subject, "subscription cap reached");
            if let Some(inbound) = self.inbound() {
                inbound.server_error(SubError::MaxSubscriptionsExceeded);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, sid: SubscriptionId, max: Option<u64>) -> Result<()> {
        self.check_open()?;
        let mut routes = self.routes.lock();
        match max {
            Some(max) => {
                let done = match routes.by_sid.get_mut(&sid) {
                    Some(route) => {
                        route.max = Some(max);
                        route.sent >= max
                    }
                    None => false,
                };
                if done {
                    routes.by_sid.remove(&sid);
                }
            }
            None => {
                routes.by_sid.remove(&sid);
            }
        }
        Ok(())
    }

    fn publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        let targets = self.routes.lock().select(subject);
        trace!(subject, recipients = targets.len(), "routing message");

        // Delivered after the routes lock is released: closing a
        // subscription from the routing path calls back into `unsubscribe`.
        if let Some(inbound) = self.inbound() {
            for sid in targets {
                inbound.deliver(sid, subject, reply, payload.to_vec());
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut routes = self.routes.lock();
            routes.by_sid.clear();
            routes.cursors.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(subject: &str, queue_group: Option<&str>) -> Route {
        Route {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            max: None,
            sent: 0,
        }
    }

    #[test]
    fn test_exact_subject_routing() {
        let mut routes = Routes::default();
        routes.by_sid.insert(SubscriptionId(1), route("foo", None));
        routes.by_sid.insert(SubscriptionId(2), route("bar", None));
        routes.by_sid.insert(SubscriptionId(3), route("foo", None));

        assert_eq!(
            routes.select("foo"),
            vec![SubscriptionId(1), SubscriptionId(3)]
        );
        assert!(routes.select("baz").is_empty());
    }

    #[test]
    fn test_queue_group_round_robin() {
        let mut routes = Routes::default();
        routes.by_sid.insert(SubscriptionId(1), route("foo", Some("workers")));
        routes.by_sid.insert(SubscriptionId(2), route("foo", Some("workers")));

        let picks: Vec<_> = (0..4).flat_map(|_| routes.select("foo")).collect();
        assert_eq!(
            picks,
            vec![
                SubscriptionId(1),
                SubscriptionId(2),
                SubscriptionId(1),
                SubscriptionId(2)
            ]
        );
    }

    #[test]
    fn test_server_side_max_removes_route() {
        let mut routes = Routes::default();
        let mut r = route("foo", None);
        r.max = Some(2);
        routes.by_sid.insert(SubscriptionId(1), r);

        assert_eq!(routes.select("foo").len(), 1);
        assert_eq!(routes.select("foo").len(), 1);
        assert!(routes.select("foo").is_empty());
        assert!(routes.by_sid.is_empty());
    }

    #[test]
    fn test_closed_loopback_rejects_requests() {
        let loopback = Loopback::new(LoopbackConfig::default());
        loopback.close();
        assert_eq!(loopback.publish("foo", None, b""), Err(SubError::ConnectionClosed));
        assert_eq!(loopback.flush(), Err(SubError::ConnectionClosed));
        assert_eq!(
            loopback.subscribe(SubscriptionId(1), "foo", None),
            Err(SubError::ConnectionClosed)
        );
    }
}
