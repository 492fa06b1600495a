//! Dedicated delivery worker for async subscriptions.
//!
//! Each async subscription owns one thread that drains its queue in FIFO
//! order and runs the handler for one message at a time. Workers of
//! different subscriptions never share a thread, so a handler blocked on
//! another subscription's delivery cannot starve it.

use crate::error::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error};

use super::subscription::{MessageHandler, Subscription};

/// Start the delivery worker for `sub`.
pub(crate) fn spawn_worker(sub: Subscription, handler: MessageHandler) -> Result<()> {
    thread::Builder::new()
        .name(format!("subflow-sub-{}", sub.id()))
        .spawn(move || run(sub, handler))?;
    Ok(())
}

fn run(sub: Subscription, mut handler: MessageHandler) {
    debug!(sid = %sub.id(), subject = %sub.subject(), "delivery worker started");

    while let Some(msg) = sub.next_for_dispatch() {
        let size = msg.size();
        if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
            error!(sid = %sub.id(), subject = %sub.subject(), "message handler panicked");
        }
        if !sub.complete_dispatch(size) {
            break;
        }
    }

    debug!(sid = %sub.id(), "delivery worker stopped");
}
