//! One-shot results delivered from a worker thread.
//!
//! A `Pending<T>` is the caller's half: it can be polled, waited on with a
//! timeout, or waited on indefinitely. The worker holds the `Resolver<T>`.
//! Dropping a resolver without resolving turns into an error for the waiter
//! instead of a hang.

use crate::error::{Result, VoxError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use std::time::Duration;

/// Create a linked resolver/pending pair.
pub fn pending<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = bounded(1);
    (Resolver { tx }, Pending { rx })
}

/// Worker half of a one-shot result.
#[derive(Debug)]
pub struct Resolver<T> {
    tx: Sender<Result<T>>,
}

impl<T> Resolver<T> {
    /// Deliver the result. A waiter that already gave up is not an error.
    pub fn resolve(self, value: Result<T>) {
        // Capacity is 1 and this consumes self, so the send never blocks.
        if self.tx.send(value).is_err() {
            tracing::debug!("result dropped: nobody is waiting for it");
        }
    }
}

/// Caller half of a one-shot result.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block until the worker resolves.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(abandoned()))
    }

    /// Block for at most `timeout`. Returns `None` if nothing arrived yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

fn abandoned() -> VoxError {
    VoxError::Other("worker exited without delivering a result".to_string())
}
