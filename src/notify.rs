//! Connection-wide callback dispatcher.
//!
//! Error handlers and closed handlers run on one dedicated thread per
//! connection, never on the routing path or under a subscription lock.
//! The thread exits once the connection state (which owns the sender) is
//! dropped.

use crate::connection::Connection;
use crate::error::{Result, SubError};
use crate::subscriptions::Subscription;
use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::error;

/// Connection-wide handler for errors raised outside any caller's stack.
pub type ErrorHandler = Arc<dyn Fn(&Connection, Option<&Subscription>, &SubError) + Send + Sync>;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Notifier {
    sender: Sender<Job>,
}

impl Notifier {
    pub(crate) fn start(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name(format!("{name}-callbacks"))
            .spawn(move || run(receiver))?;
        Ok(Self { sender })
    }

    /// Queue `job` for the callback thread, or run it inline if that thread
    /// is gone. Callers must not hold any subscription lock.
    pub(crate) fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(SendError(job)) = self.sender.send(Box::new(job)) {
            job();
        }
    }
}

fn run(receiver: Receiver<Job>) {
    for job in receiver.iter() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("connection callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order() {
        let notifier = Notifier::start("test").unwrap();
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            notifier.schedule(move || tx.send(i).unwrap());
        }
        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_stop_thread() {
        let notifier = Notifier::start("test").unwrap();
        notifier.schedule(|| panic!("boom"));
        let (tx, rx) = unbounded();
        notifier.schedule(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
