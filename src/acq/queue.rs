//! Event queues and rendezvous primitives.
//!
//! Each acquisition owns one bounded blocking deque of events. Producers
//! block when it is full, which is the backpressure path from disk and
//! hardware speed back to event generation. Deque (not channel) semantics
//! are required: a settings change discards the not-yet-consumed tail in
//! reverse order while the engine may be draining the front.
//!
//! Cancellation is cooperative: [`EventQueue::interrupt`] makes every
//! blocked and future `put` return [`Aborted`]; the abort path itself uses
//! [`EventQueue::force_put`] to deliver the final marker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::Aborted;

use super::event::AcquisitionEvent;

// =============================================================================
// EventQueue
// =============================================================================

struct QueueState {
    deque: VecDeque<AcquisitionEvent>,
    interrupted: bool,
}

/// Bounded blocking deque of acquisition events.
pub struct EventQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                deque: VecDeque::with_capacity(capacity),
                interrupted: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Append an event, blocking while the queue is full.
    ///
    /// Returns [`Aborted`] when the queue has been interrupted, checked
    /// before and after every blocking wait.
    pub fn put(&self, event: AcquisitionEvent) -> Result<(), Aborted> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.interrupted {
                return Err(Aborted);
            }
            if state.deque.len() < self.capacity {
                state.deque.push_back(event);
                self.not_empty.notify_all();
                return Ok(());
            }
            state = self.not_full.wait(state).unwrap();
        }
    }

    /// Append an event regardless of capacity or interruption. Only the
    /// abort path uses this, to guarantee the final marker is delivered.
    pub fn force_put(&self, event: AcquisitionEvent) {
        let mut state = self.state.lock().unwrap();
        state.deque.push_back(event);
        self.not_empty.notify_all();
    }

    /// Remove and return the front event, blocking while empty.
    ///
    /// The consumer is never unblocked by interruption; abort delivers a
    /// marker instead, so the consumer always observes a well-formed end.
    pub fn take(&self) -> AcquisitionEvent {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.deque.pop_front() {
                self.not_full.notify_all();
                return event;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Remove the front event without blocking.
    pub fn try_take(&self) -> Option<AcquisitionEvent> {
        let mut state = self.state.lock().unwrap();
        let event = state.deque.pop_front();
        if event.is_some() {
            self.not_full.notify_all();
        }
        event
    }

    /// Remove the back event without blocking. Used to discard pending
    /// events in reverse while the front may be consumed concurrently.
    pub fn poll_last(&self) -> Option<AcquisitionEvent> {
        let mut state = self.state.lock().unwrap();
        let event = state.deque.pop_back();
        if event.is_some() {
            self.not_full.notify_all();
        }
        event
    }

    /// Discard everything currently queued, back to front.
    pub fn clear_in_reverse(&self) {
        while self.poll_last().is_some() {}
    }

    /// Make all blocked and future `put` calls fail with [`Aborted`].
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        state.interrupted = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Latch
// =============================================================================

/// Single-slot rendezvous: one or more signals open it, one wait consumes
/// it and re-arms. Stands in for a re-armed countdown latch.
pub struct Latch {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Open the latch. Signalling an already-open latch is a no-op.
    pub fn signal(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Block until the latch opens, consuming the signal.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Consume a pending signal without blocking. Returns whether one was
    /// pending.
    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

// =============================================================================
// Tests
// =============================================================================
