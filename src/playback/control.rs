//! Handle shared between the caller and the playback thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// How a playback session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every queued block was played.
    Completed,
    /// Stopped by [`PlaybackControl::abort`] or by stream cancellation.
    Aborted,
    /// The queue ran dry while the stream was still running.
    Underrun,
    /// The device could not be opened or failed while playing.
    Failed(String),
}

type AbortWaker = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Shared {
    abort: AtomicBool,
    outcome: Mutex<Option<PlaybackOutcome>>,
    finished: Condvar,
    /// Run once by `abort`, so a waiting output loop wakes at once.
    wakers: Mutex<Vec<AbortWaker>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("abort", &self.abort)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Abort and wait on a playback session.
#[derive(Debug, Clone, Default)]
pub struct PlaybackControl {
    shared: Arc<Shared>,
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the output stream at the next callback.
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        let wakers = std::mem::take(
            &mut *self
                .shared
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for wake in wakers {
            wake();
        }
    }

    /// Run `wake` when the session is aborted, or now if it already was.
    pub(crate) fn on_abort(&self, wake: impl Fn() + Send + 'static) {
        let mut wakers = self
            .shared
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_aborted() {
            drop(wakers);
            wake();
        } else {
            wakers.push(Box::new(wake));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst)
    }

    /// Block until playback has ended.
    pub fn wait(&self) -> PlaybackOutcome {
        let mut outcome = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self
                .shared
                .finished
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PlaybackOutcome> {
        let outcome = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (outcome, _) = self
            .shared
            .finished
            .wait_timeout_while(outcome, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// The outcome if playback has ended.
    pub fn outcome(&self) -> Option<PlaybackOutcome> {
        self.shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the end of playback. Only the first call has an effect.
    pub(crate) fn mark_finished(&self, outcome: PlaybackOutcome) {
        let mut slot = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            tracing::debug!(?outcome, "playback finished");
            *slot = Some(outcome);
            self.shared.finished.notify_all();
        }
    }
}
