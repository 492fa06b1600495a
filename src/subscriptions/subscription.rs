//! Subscription state, flow control and the synchronous delivery driver.

use crate::connection::Shared;
use crate::error::{Result, SubError};
use crate::types::{Message, SubscriptionId};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::queue::{Admission, DeliveryQueue, PendingLimits};
use super::status::{StatusMachine, SubscriptionStatus};
use super::types::{CloseReason, SubscriptionMode, SubscriptionStats};

/// Handler invoked once per message on an async subscription's worker.
pub(crate) type MessageHandler = Box<dyn FnMut(Message) + Send + 'static>;

/// Handler invoked once, with the subject, when a subscription closes.
pub(crate) type ClosedHandler = Box<dyn FnOnce(&str) + Send + 'static>;

/// Delivery mode plus its mode-specific sink.
pub(crate) enum Delivery {
    Sync,
    Async(MessageHandler),
    Channel(Sender<Message>),
}

impl Delivery {
    pub(crate) fn mode(&self) -> SubscriptionMode {
        match self {
            Delivery::Sync => SubscriptionMode::Sync,
            Delivery::Async(_) => SubscriptionMode::Async,
            Delivery::Channel(_) => SubscriptionMode::Channel,
        }
    }
}

pub(crate) struct Inner {
    sid: SubscriptionId,
    subject: String,
    queue_group: Option<String>,
    mode: SubscriptionMode,
    conn: Weak<Shared>,
    state: Mutex<State>,
    /// Signalled on enqueue, close, sticky error and drain progress.
    cond: Condvar,
}

struct State {
    queue: DeliveryQueue,
    /// Caller-owned channel for Channel mode. Never closed by us.
    channel: Option<Sender<Message>>,
    status: StatusMachine,
    delivered: u64,
    /// Auto-unsubscribe ceiling.
    max: Option<u64>,
    sticky: Option<SubError>,
    close_reason: Option<CloseReason>,
    closed_handler: Option<ClosedHandler>,
    /// Set once the drain's unsubscribe has been flushed to the server.
    drain_flushed: bool,
}

/// Work to run after the subscription lock is released.
#[derive(Default)]
#[must_use]
struct Followup {
    slow_consumer: bool,
    closed: Option<Closed>,
}

struct Closed {
    reason: CloseReason,
    handler: Option<ClosedHandler>,
}

/// Handle to a subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub(crate) fn new(
        sid: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        delivery: &Delivery,
        limits: PendingLimits,
        status_buffer: usize,
        conn: Weak<Shared>,
    ) -> Self {
        let channel = match delivery {
            Delivery::Channel(sender) => Some(sender.clone()),
            _ => None,
        };
        let state = State {
            queue: DeliveryQueue::new(limits),
            channel,
            status: StatusMachine::new(status_buffer),
            delivered: 0,
            max: None,
            sticky: None,
            close_reason: None,
            closed_handler: None,
            drain_flushed: false,
        };
        Self {
            inner: Arc::new(Inner {
                sid,
                subject,
                queue_group,
                mode: delivery.mode(),
                conn,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.sid
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.inner.queue_group.as_deref()
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.inner.mode
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.inner.state.lock().status.current()
    }

    /// False once the subscription has closed by any path.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().close_reason.is_none()
    }

    /// Why the subscription closed. Available after close.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.lock().close_reason
    }

    // --- Routing ---

    /// Offer a routed message. Never blocks and never runs application code.
    pub(crate) fn enqueue(&self, msg: Message) {
        let mut followup = Followup::default();
        {
            let mut st = self.inner.state.lock();
            if st.close_reason.is_some() {
                trace!(sid = %self.id(), "message for closed subscription discarded");
                return;
            }

            match st.channel.clone() {
                Some(channel) => match channel.try_send(msg) {
                    Ok(()) => {
                        st.delivered += 1;
                        if st.queue.end_episode() {
                            st.status.transition(SubscriptionStatus::Active);
                        }
                        if st.max.is_some_and(|max| st.delivered >= max) {
                            followup.closed = self.close_locked(&mut st, CloseReason::MaxMessages);
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        if st.queue.note_overflow() {
                            st.status.transition(SubscriptionStatus::SlowConsumer);
                            followup.slow_consumer = true;
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => st.queue.note_discard(),
                },
                None => match st.queue.push(msg) {
                    Admission::Queued => {
                        self.inner.cond.notify_all();
                    }
                    Admission::Dropped { episode_start } => {
                        if episode_start {
                            st.status.transition(SubscriptionStatus::SlowConsumer);
                            followup.slow_consumer = true;
                        }
                    }
                },
            }
        }
        self.finish(followup);
    }

    /// Latch a permanent error returned by every later synchronous read.
    pub(crate) fn latch_error(&self, err: SubError) {
        let mut st = self.inner.state.lock();
        if st.close_reason.is_none() && st.sticky.is_none() {
            st.sticky = Some(err);
            self.inner.cond.notify_all();
        }
    }

    pub(crate) fn close_for_connection(&self) {
        let followup = {
            let mut st = self.inner.state.lock();
            Followup {
                closed: self.close_locked(&mut st, CloseReason::ConnectionClosed),
                ..Default::default()
            }
        };
        self.finish(followup);
    }

    // --- Sync delivery ---

    /// Block until a message is available, the subscription closes, a
    /// sticky error is latched, or `timeout` elapses.
    pub fn next_message(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now().checked_add(timeout);
        let mut followup = Followup::default();
        let result = {
            let mut st = self.inner.state.lock();
            loop {
                if let Some(reason) = st.close_reason {
                    break Err(reason.read_error());
                }
                if self.inner.mode != SubscriptionMode::Sync {
                    break Err(SubError::SyncSubscriptionRequired);
                }
                if let Some(err) = &st.sticky {
                    break Err(err.clone());
                }
                if let Some((msg, episode_ended)) = st.queue.pop() {
                    if episode_ended {
                        st.status.transition(SubscriptionStatus::Active);
                    }
                    st.delivered += 1;
                    followup.closed = if st.max.is_some_and(|max| st.delivered >= max) {
                        self.close_locked(&mut st, CloseReason::MaxMessages)
                    } else {
                        self.drain_complete_locked(&mut st)
                    };
                    break Ok(msg);
                }
                match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            break Err(SubError::Timeout);
                        }
                        self.inner.cond.wait_until(&mut st, deadline);
                    }
                    None => self.inner.cond.wait(&mut st),
                }
            }
        };
        self.finish(followup);
        result
    }

    // --- Async delivery (driven by the dispatch worker) ---

    /// Wait for the next message to hand to the async handler.
    ///
    /// The message stays counted as pending until `complete_dispatch`.
    /// Returns `None` once the subscription is closed.
    pub(crate) fn next_for_dispatch(&self) -> Option<Message> {
        let mut followup = Followup::default();
        let next = {
            let mut st = self.inner.state.lock();
            loop {
                if st.close_reason.is_some() {
                    break None;
                }
                if let Some(msg) = st.queue.take() {
                    st.delivered += 1;
                    if st.max.is_some_and(|max| st.delivered >= max) {
                        followup.closed = self.close_locked(&mut st, CloseReason::MaxMessages);
                    }
                    break Some(msg);
                }
                self.inner.cond.wait(&mut st);
            }
        };
        self.finish(followup);
        next
    }

    /// Release a dispatched message. Returns false once the worker should stop.
    pub(crate) fn complete_dispatch(&self, size: usize) -> bool {
        let mut followup = Followup::default();
        let open = {
            let mut st = self.inner.state.lock();
            if st.queue.release(size) {
                st.status.transition(SubscriptionStatus::Active);
            }
            if st.close_reason.is_none() {
                followup.closed = self.drain_complete_locked(&mut st);
            }
            st.close_reason.is_none()
        };
        self.finish(followup);
        open
    }

    // --- Auto-unsubscribe ---

    /// Close the subscription once `max` messages have been delivered in total.
    ///
    /// Closes immediately if `max` is not above the current delivered count.
    /// Safe to call from within this subscription's own handler.
    pub fn set_auto_unsubscribe(&self, max: u64) -> Result<()> {
        let followup = {
            let mut st = self.inner.state.lock();
            if st.close_reason.is_some() {
                return Err(SubError::BadSubscription);
            }
            if max <= st.delivered {
                Followup {
                    closed: self.close_locked(&mut st, CloseReason::MaxMessages),
                    ..Default::default()
                }
            } else {
                st.max = Some(max);
                Followup::default()
            }
        };

        let closing = followup.closed.is_some();
        self.finish(followup);
        if !closing {
            if let Some(shared) = self.inner.conn.upgrade() {
                if let Err(e) = shared.transport.unsubscribe(self.id(), Some(max)) {
                    debug!(sid = %self.id(), error = %e, "auto-unsubscribe request failed");
                }
            }
        }
        Ok(())
    }

    // --- Flow control accessors ---

    /// Replace the pending limits. Each value is positive or negative
    /// (unlimited); zero is invalid. Not available in Channel mode.
    pub fn set_pending_limits(&self, max_msgs: i64, max_bytes: i64) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.close_reason.is_some() {
            return Err(SubError::BadSubscription);
        }
        if self.inner.mode == SubscriptionMode::Channel {
            return Err(SubError::WrongSubscriptionType);
        }
        let limits = PendingLimits::new(max_msgs, max_bytes)?;
        if st.queue.set_limits(limits) {
            st.status.transition(SubscriptionStatus::Active);
        }
        Ok(())
    }

    pub fn pending_limits(&self) -> Result<(i64, i64)> {
        self.with_queue(|queue| {
            let limits = queue.limits();
            (limits.msgs(), limits.bytes())
        })
    }

    /// Current `(messages, bytes)` awaiting delivery.
    pub fn pending(&self) -> Result<(usize, usize)> {
        self.with_queue(|queue| queue.pending())
    }

    /// High-water mark of `pending()` since creation or the last clear.
    pub fn max_pending(&self) -> Result<(usize, usize)> {
        self.with_queue(|queue| queue.max_pending())
    }

    pub fn clear_max_pending(&self) -> Result<()> {
        self.with_queue(|queue| queue.clear_max_pending())
    }

    pub fn dropped(&self) -> Result<u64> {
        self.with_open(|st| st.queue.dropped())
    }

    pub fn delivered(&self) -> Result<u64> {
        self.with_open(|st| st.delivered)
    }

    pub fn stats(&self) -> Result<SubscriptionStats> {
        self.with_open(|st| {
            let (pending_msgs, pending_bytes) = st.queue.pending();
            let (max_pending_msgs, max_pending_bytes) = st.queue.max_pending();
            SubscriptionStats {
                id: self.id(),
                subject: self.inner.subject.clone(),
                queue_group: self.inner.queue_group.clone(),
                mode: self.inner.mode,
                status: st.status.current(),
                delivered: st.delivered,
                dropped: st.queue.dropped(),
                pending_msgs,
                pending_bytes,
                max_pending_msgs,
                max_pending_bytes,
                max: st.max,
            }
        })
    }

    // --- Lifecycle ---

    /// Close now, discarding anything still queued.
    pub fn unsubscribe(&self) -> Result<()> {
        let followup = {
            let mut st = self.inner.state.lock();
            if st.close_reason.is_some() {
                return Err(SubError::BadSubscription);
            }
            Followup {
                closed: self.close_locked(&mut st, CloseReason::Unsubscribed),
                ..Default::default()
            }
        };
        self.finish(followup);
        Ok(())
    }

    /// Stop new deliveries and close once queued messages are consumed.
    ///
    /// Returns immediately; completion is observable through the status
    /// observers or the closed handler.
    pub fn drain(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.close_reason.is_some() {
                return Err(SubError::BadSubscription);
            }
            if !st.status.transition(SubscriptionStatus::Draining) {
                return Ok(());
            }
        }
        debug!(sid = %self.id(), subject = %self.subject(), "draining subscription");

        let Some(shared) = self.inner.conn.upgrade() else {
            let followup = {
                let mut st = self.inner.state.lock();
                st.drain_flushed = true;
                Followup {
                    closed: self.drain_complete_locked(&mut st),
                    ..Default::default()
                }
            };
            self.finish(followup);
            return Ok(());
        };

        if let Err(e) = shared.transport.unsubscribe(self.id(), None) {
            debug!(sid = %self.id(), error = %e, "drain unsubscribe request failed");
        }
        let sub = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("subflow-drain-{}", self.id()))
            .spawn(move || sub.await_drain(shared));
        if let Err(e) = spawned {
            self.abort_drain();
            return Err(e.into());
        }
        Ok(())
    }

    /// Force-close a drain that has no watcher to complete it.
    fn abort_drain(&self) {
        let followup = {
            let mut st = self.inner.state.lock();
            Followup {
                closed: self.close_locked(&mut st, CloseReason::DrainTimeout),
                ..Default::default()
            }
        };
        self.finish(followup);
    }

    fn await_drain(&self, shared: Arc<Shared>) {
        if let Err(e) = shared.transport.flush() {
            debug!(sid = %self.id(), error = %e, "flush during drain failed");
        }
        let deadline = Instant::now().checked_add(shared.config.drain_timeout);
        let mut timed_out = false;

        let closed = {
            let mut st = self.inner.state.lock();
            st.drain_flushed = true;
            loop {
                if st.close_reason.is_some() {
                    break None;
                }
                if let Some(closed) = self.drain_complete_locked(&mut st) {
                    break Some(closed);
                }
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => {
                        timed_out = true;
                        break self.close_locked(&mut st, CloseReason::DrainTimeout);
                    }
                    Some(deadline) => {
                        self.inner.cond.wait_until(&mut st, deadline);
                    }
                    None => self.inner.cond.wait(&mut st),
                }
            }
        };

        self.finish(Followup {
            closed,
            ..Default::default()
        });
        if timed_out {
            shared.report_async(Some(self.clone()), SubError::DrainTimeout);
        }
    }

    /// Register the handler invoked once, with the subject, on close.
    pub fn set_closed_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let mut st = self.inner.state.lock();
        if st.close_reason.is_some() {
            return Err(SubError::BadSubscription);
        }
        st.closed_handler = Some(Box::new(handler));
        Ok(())
    }

    /// Observe status changes, optionally filtered (empty = all).
    ///
    /// Best effort: a reader that falls behind may miss intermediate
    /// statuses, but always receives `Closed`.
    pub fn status_changed(&self, filter: &[SubscriptionStatus]) -> Receiver<SubscriptionStatus> {
        self.inner.state.lock().status.observe(filter)
    }

    // --- Internals ---

    fn with_open<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T> {
        let st = self.inner.state.lock();
        if st.close_reason.is_some() {
            return Err(SubError::BadSubscription);
        }
        Ok(f(&*st))
    }

    fn with_queue<T>(&self, f: impl FnOnce(&mut DeliveryQueue) -> T) -> Result<T> {
        let mut st = self.inner.state.lock();
        if st.close_reason.is_some() {
            return Err(SubError::BadSubscription);
        }
        if self.inner.mode == SubscriptionMode::Channel {
            return Err(SubError::WrongSubscriptionType);
        }
        Ok(f(&mut st.queue))
    }

    fn drain_complete_locked(&self, st: &mut State) -> Option<Closed> {
        if st.status.current() == SubscriptionStatus::Draining
            && st.drain_flushed
            && st.queue.is_idle()
        {
            self.close_locked(st, CloseReason::Drained)
        } else {
            None
        }
    }

    /// Transition to Closed. Only the first caller gets the closed handler.
    fn close_locked(&self, st: &mut State, reason: CloseReason) -> Option<Closed> {
        if st.close_reason.is_some() {
            return None;
        }
        st.close_reason = Some(reason);
        st.status.transition(SubscriptionStatus::Closed);
        st.queue.clear();
        self.inner.cond.notify_all();
        Some(Closed {
            reason,
            handler: st.closed_handler.take(),
        })
    }

    fn finish(&self, followup: Followup) {
        let shared = self.inner.conn.upgrade();

        if followup.slow_consumer {
            debug!(sid = %self.id(), subject = %self.subject(), "slow consumer episode started");
            if let Some(shared) = &shared {
                shared.report_async(Some(self.clone()), SubError::SlowConsumer);
            }
        }

        let Some(closed) = followup.closed else {
            return;
        };
        debug!(
            sid = %self.id(),
            subject = %self.subject(),
            reason = ?closed.reason,
            "subscription closed"
        );
        match shared {
            Some(shared) => {
                shared.registry.remove(self.id());
                if closed.reason.needs_unsubscribe() && !shared.is_closed() {
                    if let Err(e) = shared.transport.unsubscribe(self.id(), None) {
                        debug!(sid = %self.id(), error = %e, "unsubscribe request failed");
                    }
                }
                if let Some(handler) = closed.handler {
                    let subject = self.inner.subject.clone();
                    shared.notifier.schedule(move || handler(&subject));
                }
            }
            None => {
                if let Some(handler) = closed.handler {
                    handler(&self.inner.subject);
                }
            }
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.inner.sid)
            .field("subject", &self.inner.subject)
            .field("queue_group", &self.inner.queue_group)
            .field("mode", &self.inner.mode)
            .finish()
    }
}
