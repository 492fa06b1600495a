//! Connection handle tying the registry, transport and notifier together.

use crate::error::{Result, SubError};
use crate::notify::{ErrorHandler, Notifier};
use crate::subscriptions::dispatch::spawn_worker;
use crate::subscriptions::queue::{
    PendingLimits, DEFAULT_PENDING_BYTES_LIMIT, DEFAULT_PENDING_MSGS_LIMIT,
};
use crate::subscriptions::subscription::Delivery;
use crate::subscriptions::{Registry, Subscription};
use crate::transport::Transport;
use crate::types::{Message, SubscriptionId};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Connection configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Name used for worker thread names and log fields.
    pub name: Option<String>,

    /// Default per-subscription pending message limit.
    /// Default: 524288
    pub pending_msgs_limit: i64,

    /// Default per-subscription pending byte limit.
    /// Default: 64MB
    pub pending_bytes_limit: i64,

    /// Latch server permission denials as a sticky error on the subscription.
    /// Default: true
    pub permission_err_on_subscribe: bool,

    /// How long a drain may wait for queued messages to be consumed.
    /// Default: 30s
    pub drain_timeout: Duration,

    /// Capacity of each status observer channel.
    /// Default: 10
    pub status_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: None,
            pending_msgs_limit: DEFAULT_PENDING_MSGS_LIMIT,
            pending_bytes_limit: DEFAULT_PENDING_BYTES_LIMIT,
            permission_err_on_subscribe: true,
            drain_timeout: Duration::from_secs(30),
            status_buffer: 10,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) registry: Registry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notifier: Notifier,
    default_limits: PendingLimits,
    closed: AtomicBool,
    last_error: Mutex<Option<SubError>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record an asynchronous error and hand it to the error handler.
    pub(crate) fn report_async(self: &Arc<Self>, sub: Option<Subscription>, err: SubError) {
        *self.last_error.lock() = Some(err.clone());

        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => {
                let conn = Connection::from_shared(Arc::clone(self));
                self.notifier
                    .schedule(move || handler(&conn, sub.as_ref(), &err));
            }
            None => warn!(
                connection = self.config.name.as_deref().unwrap_or("-"),
                sid = ?sub.as_ref().map(Subscription::id),
                subject = sub.as_ref().map(Subscription::subject).unwrap_or("-"),
                error = %err,
                "asynchronous subscription error"
            ),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            connection = self.config.name.as_deref().unwrap_or("-"),
            "connection closed"
        );
        for sub in self.registry.drain() {
            sub.close_for_connection();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Wakes async workers still parked on their queues.
        self.shutdown();
    }
}

/// Client connection: creates subscriptions and routes inbound messages.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection over `transport`.
    ///
    /// The transport delivers inbound traffic through [`Connection::inbound`].
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let default_limits = PendingLimits::new(config.pending_msgs_limit, config.pending_bytes_limit)?;
        let notifier = Notifier::start(config.name.as_deref().unwrap_or("subflow"))?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                transport,
                notifier,
                default_limits,
                closed: AtomicBool::new(false),
                last_error: Mutex::new(None),
                error_handler: RwLock::new(None),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Entry points for the transport to push traffic and events.
    pub fn inbound(&self) -> Inbound {
        Inbound {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    // --- Subscribing ---

    /// Async subscription: `handler` runs on a dedicated worker thread.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_with(subject, None, Delivery::Async(Box::new(handler)))
    }

    pub fn queue_subscribe<F>(&self, subject: &str, queue_group: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.subscribe_with(subject, Some(queue_group), Delivery::Async(Box::new(handler)))
    }

    /// Sync subscription: messages are pulled with `next_message`.
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_with(subject, None, Delivery::Sync)
    }

    pub fn queue_subscribe_sync(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        self.subscribe_with(subject, Some(queue_group), Delivery::Sync)
    }

    /// Channel subscription: messages are pushed into `sender` without
    /// blocking. The channel is owned by the caller and never closed here.
    pub fn chan_subscribe(&self, subject: &str, sender: Sender<Message>) -> Result<Subscription> {
        self.subscribe_with(subject, None, Delivery::Channel(sender))
    }

    pub fn chan_queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        sender: Sender<Message>,
    ) -> Result<Subscription> {
        self.subscribe_with(subject, Some(queue_group), Delivery::Channel(sender))
    }

    fn subscribe_with(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        delivery: Delivery,
    ) -> Result<Subscription> {
        if self.is_closed() {
            return Err(SubError::ConnectionClosed);
        }
        if subject.is_empty() {
            return Err(SubError::InvalidArgument("empty subject".into()));
        }
        if queue_group.is_some_and(str::is_empty) {
            return Err(SubError::InvalidArgument("empty queue group".into()));
        }

        let shared = &self.shared;
        let sid = shared.registry.allocate_id();
        let sub = Subscription::new(
            sid,
            subject.to_string(),
            queue_group.map(str::to_string),
            &delivery,
            shared.default_limits,
            shared.config.status_buffer,
            Arc::downgrade(shared),
        );
        shared.registry.register(sub.clone());

        if let Delivery::Async(handler) = delivery {
            if let Err(e) = spawn_worker(sub.clone(), handler) {
                abandon(&sub, &e);
                return Err(e);
            }
        }

        debug!(sid = %sid, subject, queue_group, mode = ?sub.mode(), "subscribed");

        // Registered first: the transport may report a denial synchronously.
        if let Err(e) = shared.transport.subscribe(sid, subject, queue_group) {
            abandon(&sub, &e);
            return Err(e);
        }
        Ok(sub)
    }

    // --- Outbound ---

    pub fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_reply(subject, None, payload)
    }

    /// Publish with a reply subject for the receiver to respond on.
    pub fn publish_request(&self, subject: &str, reply: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_reply(subject, Some(reply), payload)
    }

    fn publish_with_reply(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SubError::ConnectionClosed);
        }
        if subject.is_empty() {
            return Err(SubError::InvalidArgument("empty subject".into()));
        }
        self.shared.transport.publish(subject, reply, payload)
    }

    /// Round-trip with the server so everything published so far was processed.
    pub fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SubError::ConnectionClosed);
        }
        self.shared.transport.flush()
    }

    // --- Lifecycle ---

    /// Close the transport and every subscription. Idempotent.
    pub fn close(&self) {
        if !self.is_closed() {
            self.shared.transport.close();
        }
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Install the connection-wide handler for asynchronous errors.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Connection, Option<&Subscription>, &SubError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Some(Arc::new(handler));
    }

    /// Most recent asynchronous error, if any.
    pub fn last_error(&self) -> Option<SubError> {
        self.shared.last_error.lock().clone()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.shared.registry.len()
    }
}

/// Close a subscription whose setup failed part way.
fn abandon(sub: &Subscription, cause: &SubError) {
    debug!(sid = %sub.id(), subject = %sub.subject(), error = %cause, "subscribe failed");
    if let Err(e) = sub.unsubscribe() {
        debug!(sid = %sub.id(), error = %e, "cleanup after failed subscribe");
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.config.name)
            .field("closed", &self.is_closed())
            .field("subscriptions", &self.num_subscriptions())
            .finish()
    }
}

/// Entry points used by the transport to feed the engine.
///
/// Holds a weak reference, so a transport keeping an `Inbound` does not
/// keep the connection alive.
#[derive(Clone)]
pub struct Inbound {
    shared: Weak<Shared>,
}

impl Inbound {
    /// Route a decoded message to subscription `sid`.
    ///
    /// Returns false if no live subscription has that id. Never blocks.
    pub fn deliver(
        &self,
        sid: SubscriptionId,
        subject: &str,
        reply: Option<&str>,
        payload: Vec<u8>,
    ) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let Some(sub) = shared.registry.lookup(sid) else {
            trace!(sid = %sid, subject, "no subscription for routed message");
            return false;
        };

        sub.enqueue(Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
            sub: sub.downgrade(),
            conn: Arc::downgrade(&shared),
        });
        true
    }

    /// The server refused subscription `sid`.
    pub fn permission_denied(&self, sid: SubscriptionId, reason: impl Into<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let err = SubError::PermissionViolation(reason.into());
        let sub = shared.registry.lookup(sid);

        warn!(sid = %sid, error = %err, "subscription denied by server");
        if let Some(sub) = &sub {
            if shared.config.permission_err_on_subscribe {
                sub.latch_error(err.clone());
            }
        }
        shared.report_async(sub, err);
    }

    /// A connection-wide server error, such as the subscription cap.
    pub fn server_error(&self, err: SubError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.report_async(None, err);
        }
    }

    /// The underlying connection is gone; close every subscription.
    pub fn connection_closed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.shutdown();
        }
    }
}
