//! Admission control for generation requests.
//!
//! Requests are admitted in the order they were enqueued, and at most
//! `max_in_flight` of them may be opening a connection at the same time.
//! A slot is held only until the connection thunk returns (response headers
//! received), so long downloads never block new dispatches. Stitched
//! generations rely on the ordering: a request that references the previous
//! one's id must not reach the server first.

use crate::error::{Result, VoxError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// FIFO admission queue with a concurrency limit.
#[derive(Debug)]
pub struct AdmissionGate {
    state: Mutex<GateState>,
    changed: Condvar,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
struct GateState {
    queue: VecDeque<u64>,
    in_flight: usize,
    next_order: u64,
}

impl AdmissionGate {
    /// Create a gate allowing `max_in_flight` concurrent connection attempts
    /// (at least one).
    pub fn new(max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            max_in_flight: max_in_flight.max(1),
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Requests enqueued but not yet admitted.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Record a request's place in line without running it.
    ///
    /// Call this on the submitting thread: the returned ticket fixes the
    /// dispatch order even if it is admitted from another thread later.
    pub fn enqueue(self: &Arc<Self>, request_id: impl Into<String>) -> Ticket {
        let mut state = self.lock();
        let order = state.next_order;
        state.next_order += 1;
        state.queue.push_back(order);
        drop(state);

        Ticket {
            gate: Arc::clone(self),
            request_id: request_id.into(),
            order,
            queued: true,
        }
    }

    /// Enqueue and run in one call, blocking the current thread until admitted.
    pub fn submit<C, F>(self: &Arc<Self>, request_id: impl Into<String>, thunk: F) -> Result<C>
    where
        F: FnOnce() -> Result<C>,
    {
        self.enqueue(request_id).admit(thunk)
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The state is a queue and a counter, both valid after any panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }
}

/// A request's place in the admission queue.
#[derive(Debug)]
pub struct Ticket {
    gate: Arc<AdmissionGate>,
    request_id: String,
    order: u64,
    queued: bool,
}

impl Ticket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Submission order, starting at zero for the gate's first request.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Wait for this ticket's turn and a free slot, then run `thunk`.
    ///
    /// The slot is released when `thunk` returns, whatever the outcome.
    /// A failing thunk is reported as `AdmissionFailure` and never retried.
    pub fn admit<C, F>(mut self, thunk: F) -> Result<C>
    where
        F: FnOnce() -> Result<C>,
    {
        let gate = Arc::clone(&self.gate);
        {
            let mut state = gate.lock();
            while !(state.queue.front() == Some(&self.order)
                && state.in_flight < gate.max_in_flight)
            {
                state = gate
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            // Dequeue and slot acquisition happen under the same lock.
            state.queue.pop_front();
            state.in_flight += 1;
            self.queued = false;
        }
        // The next ticket may be admissible right away if slots remain.
        gate.changed.notify_all();

        tracing::debug!(request = %self.request_id, order = self.order, "admitted");

        let _slot = SlotGuard { gate: &gate };
        thunk().map_err(|e| VoxError::AdmissionFailure {
            request_id: self.request_id.clone(),
            message: e.to_string(),
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.queued {
            return;
        }
        let mut state = self.gate.lock();
        state.queue.retain(|&order| order != self.order);
        drop(state);
        self.gate.changed.notify_all();
    }
}

/// Releases the slot even if the thunk panics.
struct SlotGuard<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
