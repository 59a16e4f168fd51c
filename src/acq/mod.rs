//! Acquisition event pipeline.
//!
//! Events are generated per acquisition by a dedicated thread walking the
//! time/position/slice/channel space, merged across acquisitions by the
//! group scheduler at timepoint granularity, and consumed by the single
//! execution engine thread that owns the hardware. Captured images flow
//! through a per-acquisition sink into pyramid storage.
//!
//! ```text
//! generator ──> bounded event queue ──> group scheduler ──> engine
//!                                                             │
//!                                 storage <── image sink <────┘
//! ```

mod engine;
mod event;
mod explore;
mod generator;
mod group;
mod queue;
mod settings;
mod sink;

pub use engine::{EngineTask, ExecutionEngine};
pub use event::{AcquisitionEvent, AutofocusMove, Special};
pub use explore::{ExploreAcquisition, EXPLORE_QUEUE_CAP};
pub use group::AcquisitionGroup;
pub use queue::{EventQueue, Latch};
pub use settings::{
    AcquisitionSettings, AutofocusSettings, ChannelSettings, CovariantPairing, FocusAdvisor,
    SpaceMode,
};
pub use sink::{ImageSink, SinkMessage};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::coords::{AffineTransform, XyPosition};
use crate::error::{Aborted, AcqError};
use crate::hardware::Hardware;
use crate::storage::PyramidStorage;

use sink::FlushHooks;

/// Event queue capacity of a generator-driven acquisition.
pub const FIXED_QUEUE_CAP: usize = 25;

// =============================================================================
// AcquisitionContext
// =============================================================================

/// Everything an acquisition needs from its surroundings: the hardware
/// handle, camera frame geometry, and where data sets go. Threaded through
/// constructors explicitly; there is no process-global state.
#[derive(Clone)]
pub struct AcquisitionContext {
    pub hardware: Arc<dyn Hardware>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub byte_depth: u8,
    pub rgb: bool,
    pub pixel_size_um: f64,
    pub affine: AffineTransform,
    pub storage_root: PathBuf,
    pub estimate_background: bool,
}

// =============================================================================
// Acquisition
// =============================================================================

/// Shared state of one logical acquisition: its settings, positions,
/// event queue, storage, sink, and the flags and rendezvous that
/// coordinate its generator with the scheduler and engine.
pub struct Acquisition {
    pub(crate) index: usize,
    pub(crate) settings: AcquisitionSettings,
    pub(crate) positions: Arc<Vec<XyPosition>>,
    pub(crate) queue: EventQueue,
    pub(crate) storage: Arc<PyramidStorage>,
    pub(crate) sink: ImageSink,

    /// Z of slice index 0, fixed when the acquisition is assembled
    pub(crate) z_origin: f64,

    abort: AtomicBool,
    settings_changed: AtomicBool,
    pub(crate) finish_event_sent: AtomicBool,
    finished_generating: AtomicBool,

    /// Scheduler grants the next timepoint through this latch
    pub(crate) ready: Latch,

    /// Set by the sink when a timepoint's images are durably written
    tp_flushed: Arc<AtomicBool>,
    tp_wake_tx: Sender<()>,
    tp_wake_rx: Receiver<()>,

    /// Wakes a generator sleeping out its timepoint interval on abort
    shutdown_tx: Sender<()>,
    pub(crate) shutdown_rx: Receiver<()>,

    start_time: Mutex<Option<Instant>>,
    min_slice: AtomicI64,
    max_slice: AtomicI64,
}

impl Acquisition {
    /// Validate settings and assemble an acquisition: storage directory,
    /// container writers, and sink thread.
    ///
    /// Validation happens first; a rejected configuration creates no
    /// on-disk state at all.
    pub fn create(
        index: usize,
        settings: AcquisitionSettings,
        positions: Vec<XyPosition>,
        ctx: &AcquisitionContext,
    ) -> Result<Arc<Self>, AcqError> {
        Self::create_with_queue_cap(index, settings, positions, ctx, FIXED_QUEUE_CAP)
    }

    pub(crate) fn create_with_queue_cap(
        index: usize,
        settings: AcquisitionSettings,
        positions: Vec<XyPosition>,
        ctx: &AcquisitionContext,
        queue_cap: usize,
    ) -> Result<Arc<Self>, AcqError> {
        settings.validate(&positions)?;

        // Plane modes image wherever the focus drive currently sits
        let current_z = ctx
            .hardware
            .focus_position(&settings.z_device)
            .unwrap_or(0.0);
        let z_origin = settings.space.z_top(current_z, settings.z_limits);

        let summary = settings.summary(
            ctx.frame_width,
            ctx.frame_height,
            ctx.byte_depth,
            ctx.rgb,
            ctx.pixel_size_um,
            &ctx.affine.to_metadata_string(),
            &positions,
        );
        let storage = Arc::new(PyramidStorage::create(
            &ctx.storage_root,
            &summary,
            positions.clone(),
            ctx.estimate_background,
        )?);

        let tp_flushed = Arc::new(AtomicBool::new(false));
        let (tp_wake_tx, tp_wake_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let sink = ImageSink::spawn(
            &settings.name,
            Arc::clone(&storage),
            FlushHooks {
                flushed: Arc::clone(&tp_flushed),
                wake: tp_wake_tx.clone(),
            },
        );

        Ok(Arc::new(Self {
            index,
            settings,
            positions: Arc::new(positions),
            queue: EventQueue::new(queue_cap),
            storage,
            sink,
            z_origin,
            abort: AtomicBool::new(false),
            settings_changed: AtomicBool::new(false),
            finish_event_sent: AtomicBool::new(false),
            finished_generating: AtomicBool::new(false),
            ready: Latch::new(),
            tp_flushed,
            tp_wake_tx,
            tp_wake_rx,
            shutdown_tx,
            shutdown_rx,
            start_time: Mutex::new(None),
            min_slice: AtomicI64::new(0),
            max_slice: AtomicI64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn storage(&self) -> &Arc<PyramidStorage> {
        &self.storage
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Whether the generator has emitted everything it ever will.
    pub fn finished_generating(&self) -> bool {
        self.finished_generating.load(Ordering::Acquire)
    }

    /// Whether storage has been finalized.
    pub fn is_finished(&self) -> bool {
        self.sink.is_done()
    }

    /// Block until the sink has drained and storage is finalized.
    pub fn wait_storage_finished(&self) {
        self.sink.wait_done();
    }

    /// Smallest and largest slice index emitted so far.
    pub fn slice_extent(&self) -> (i64, i64) {
        (
            self.min_slice.load(Ordering::Relaxed),
            self.max_slice.load(Ordering::Relaxed),
        )
    }

    /// Request a cooperative abort.
    ///
    /// Returns immediately. The generator observes the flag at its next
    /// blocking point, discards pending events, delivers the single
    /// acquisition-finished marker, and notifies the scheduler; storage
    /// keeps every tile that was already durable.
    pub fn request_abort(&self) {
        if self.finished_generating() {
            return;
        }
        self.abort.store(true, Ordering::Release);
        self.queue.interrupt();
        let _ = self.shutdown_tx.send(());
        let _ = self.tp_wake_tx.send(());
        self.ready.signal();
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Tell a mid-generation acquisition that its settings (typically a
    /// surface) changed: pending events of the current timepoint are
    /// discarded and emission restarts from the last confirmed position.
    pub fn notify_settings_changed(&self) {
        self.settings_changed.store(true, Ordering::Release);
        let _ = self.tp_wake_tx.send(());
    }

    // -------------------------------------------------------------------------
    // Generator-side helpers
    // -------------------------------------------------------------------------

    pub(crate) fn check_abort(&self) -> Result<(), Aborted> {
        if self.abort_requested() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    pub(crate) fn take_settings_changed(&self) -> bool {
        self.settings_changed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn settings_changed_pending(&self) -> bool {
        self.settings_changed.load(Ordering::Acquire)
    }

    pub(crate) fn take_tp_flushed(&self) -> bool {
        self.tp_flushed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn wait_tp_wake(&self) {
        let _ = self.tp_wake_rx.recv();
    }

    pub(crate) fn mark_finished_generating(&self) {
        self.finished_generating.store(true, Ordering::Release);
    }

    pub(crate) fn note_slice(&self, slice: i64) {
        self.min_slice.fetch_min(slice, Ordering::Relaxed);
        self.max_slice.fetch_max(slice, Ordering::Relaxed);
    }

    /// Milliseconds since the first image of this acquisition, starting
    /// the clock on first use.
    pub(crate) fn elapsed_ms(&self) -> i64 {
        let mut start = self.start_time.lock().unwrap();
        match *start {
            Some(t0) => t0.elapsed().as_millis() as i64,
            None => {
                *start = Some(Instant::now());
                0
            }
        }
    }
}
