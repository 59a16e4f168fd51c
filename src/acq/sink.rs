//! Per-acquisition image sink.
//!
//! One thread per acquisition sits between the execution engine and
//! pyramid storage. Captured images flow through a bounded channel
//! (backpressure from disk speed reaches the engine, and through the
//! event queues, the generator). Timepoint and acquisition markers
//! forwarded by the engine tell the sink when a logical unit of images is
//! durably complete, which is what releases the generator's
//! images-flushed rendezvous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::storage::{PyramidStorage, TaggedImage};

/// In-flight images allowed before the engine blocks.
const SINK_QUEUE_CAP: usize = 64;

/// Messages from the engine to a sink.
pub enum SinkMessage {
    Image(TaggedImage),
    TimepointFinished,
    AcquisitionFinished,
}

/// Hooks the sink uses to release the generator's rendezvous.
pub(crate) struct FlushHooks {
    pub flushed: Arc<AtomicBool>,
    pub wake: Sender<()>,
}

/// Handle to a running sink thread.
pub struct ImageSink {
    tx: Sender<SinkMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: Arc<AtomicBool>,
}

impl ImageSink {
    pub(crate) fn spawn(
        name: &str,
        storage: Arc<PyramidStorage>,
        hooks: FlushHooks,
    ) -> Self {
        let (tx, rx) = bounded::<SinkMessage>(SINK_QUEUE_CAP);
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let thread_name = format!("{name}: image sink");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        SinkMessage::Image(img) => {
                            // Storage faults are best-effort: one lost tile
                            // must not end the run
                            if let Err(e) = storage.put_image(img) {
                                warn!("{thread_name}: failed storing image: {e}");
                            }
                        }
                        SinkMessage::TimepointFinished => {
                            hooks.flushed.store(true, Ordering::Release);
                            let _ = hooks.wake.send(());
                        }
                        SinkMessage::AcquisitionFinished => {
                            if let Err(e) = storage.finished() {
                                warn!("{thread_name}: failed finalizing storage: {e}");
                            }
                            hooks.flushed.store(true, Ordering::Release);
                            let _ = hooks.wake.send(());
                            break;
                        }
                    }
                }
                done_flag.store(true, Ordering::Release);
                debug!("{thread_name}: exiting");
            })
            .expect("failed to spawn sink thread");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            done,
        }
    }

    /// Send a message, blocking while the sink queue is full.
    pub fn send(&self, msg: SinkMessage) {
        if self.tx.send(msg).is_err() {
            warn!("image sink is gone; message dropped");
        }
    }

    /// Whether the sink has observed its acquisition-finished marker and
    /// exited.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until the sink thread has fully drained and exited.
    pub fn wait_done(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("image sink thread panicked");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
