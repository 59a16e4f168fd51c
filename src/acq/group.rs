//! Acquisition group scheduling.
//!
//! N acquisitions share one engine. "Parallel" means round-robin fairness
//! at timepoint granularity, never concurrent hardware access: exactly one
//! acquisition is active (its queue being drained) at a time. Handoff
//! happens when the active acquisition finishes generating a timepoint and
//! its images are flushed; abort of an inactive acquisition parks its
//! finishing event in a side queue that the engine drains with priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use super::event::AcquisitionEvent;
use super::{generator, Acquisition};

struct GroupState {
    active_index: usize,
    finished: Vec<bool>,
}

/// Round-robin scheduler over an ordered list of acquisitions.
pub struct AcquisitionGroup {
    acqs: Vec<Arc<Acquisition>>,
    state: Mutex<GroupState>,

    /// Finishing events of acquisitions aborted while inactive; drained
    /// by [`next_event`](Self::next_event) before the active queue
    side_queue: Mutex<VecDeque<AcquisitionEvent>>,

    all_done: AtomicBool,
    generators: Mutex<Vec<JoinHandle<()>>>,
}

impl AcquisitionGroup {
    pub fn new(acqs: Vec<Arc<Acquisition>>) -> Arc<Self> {
        let count = acqs.len();
        Arc::new(Self {
            acqs,
            state: Mutex::new(GroupState {
                active_index: 0,
                finished: vec![false; count],
            }),
            side_queue: Mutex::new(VecDeque::new()),
            all_done: AtomicBool::new(count == 0),
            generators: Mutex::new(Vec::new()),
        })
    }

    /// Spawn every generator and grant the first acquisition its first
    /// timepoint.
    pub fn start(self: &Arc<Self>) {
        let mut generators = self.generators.lock().unwrap();
        for acq in &self.acqs {
            generators.push(generator::spawn(Arc::clone(acq), Arc::clone(self)));
        }
        if let Some(first) = self.acqs.first() {
            first.ready.signal();
        }
    }

    pub fn acquisitions(&self) -> &[Arc<Acquisition>] {
        &self.acqs
    }

    /// Index of the acquisition whose queue the engine is draining.
    pub fn active_index(&self) -> usize {
        self.state.lock().unwrap().active_index
    }

    /// Whether every acquisition has finished generating.
    pub fn is_finished(&self) -> bool {
        self.all_done.load(Ordering::Acquire)
    }

    /// Abort every acquisition in the group.
    pub fn abort_all(&self) {
        for acq in &self.acqs {
            acq.request_abort();
        }
    }

    /// Block until all generator threads have exited.
    pub fn wait_generators(&self) {
        let handles: Vec<_> = self.generators.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// The merged event stream consumed by the engine.
    ///
    /// Captured finishing events take priority; otherwise this blocks on
    /// the active acquisition's queue. A requeue marker wakes the engine
    /// when the active index moved, so no event is ever consumed from an
    /// inactive queue.
    pub(crate) fn next_event(&self) -> AcquisitionEvent {
        if let Some(event) = self.side_queue.lock().unwrap().pop_front() {
            return event;
        }
        if self.is_finished() {
            return AcquisitionEvent::engine_task_finished();
        }
        let active = self.active_index();
        self.acqs[active].queue.take()
    }

    /// Called by a generator after its timepoint's images are flushed:
    /// advance the active index round-robin to the next unfinished
    /// acquisition, grant it its timepoint, and wake any consumer still
    /// blocked on the old queue.
    pub(crate) fn finished_timepoint(&self, index: usize) {
        let next = {
            let mut state = self.state.lock().unwrap();
            if self.acqs[index].finished_generating() {
                state.finished[index] = true;
            }
            let count = self.acqs.len();
            let next = (1..=count)
                .map(|k| (index + k) % count)
                .find(|&i| !state.finished[i]);
            if let Some(i) = next {
                state.active_index = i;
            }
            next
        };

        match next {
            Some(i) => {
                debug!("scheduler: acquisition {index} yielded, {i} active");
                self.acqs[i].ready.signal();
                if i != index {
                    self.acqs[index]
                        .queue
                        .force_put(AcquisitionEvent::requeue(index));
                }
            }
            None => {
                info!("scheduler: all acquisitions finished");
                self.all_done.store(true, Ordering::Release);
                self.acqs[index]
                    .queue
                    .force_put(AcquisitionEvent::requeue(index));
            }
        }
    }

    /// Called by an aborting generator after it delivered its finishing
    /// marker.
    ///
    /// Active: wait for the sink to fully drain, then advance as if the
    /// timepoint finished. Inactive: capture the pending finishing event
    /// into the side queue so its completion is observed exactly once
    /// without starving the active acquisition.
    pub(crate) fn acquisition_aborted(&self, index: usize) {
        let was_active = self.active_index() == index;
        if was_active {
            self.acqs[index].sink.wait_done();
            self.finished_timepoint(index);
            return;
        }

        {
            let mut side = self.side_queue.lock().unwrap();
            while let Some(event) = self.acqs[index].queue.try_take() {
                side.push_back(event);
            }
        }
        let all = {
            let mut state = self.state.lock().unwrap();
            state.finished[index] = true;
            state.finished.iter().all(|f| *f)
        };
        if all {
            self.all_done.store(true, Ordering::Release);
        }
    }
}
