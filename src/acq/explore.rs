//! Explore acquisition: manually driven tile collection.
//!
//! No generator thread; the user enqueues tile requests as they pan and
//! zoom, and the engine executes them through the same pipeline as fixed
//! acquisitions. The queue is much larger than a generator-driven one
//! because a user can outline many tiles at once. Positions are created on
//! demand in the storage position arena, which lets the grid grow in any
//! direction from wherever the stage happened to be.

use std::ops::RangeInclusive;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::coords::XyPosition;
use crate::error::{Aborted, AcqError};
use crate::storage::PyramidStorage;

use super::event::AcquisitionEvent;
use super::{Acquisition, AcquisitionContext, AcquisitionSettings};

/// Event queue capacity of an explore acquisition.
pub const EXPLORE_QUEUE_CAP: usize = 256;

/// A manually driven acquisition.
pub struct ExploreAcquisition {
    acq: Arc<Acquisition>,
}

impl ExploreAcquisition {
    /// Create an explore acquisition anchored at the current stage
    /// position, which becomes grid cell (0, 0).
    pub fn create(
        settings: AcquisitionSettings,
        ctx: &AcquisitionContext,
    ) -> Result<Arc<Self>, AcqError> {
        let (stage_x, stage_y) = ctx
            .hardware
            .stage_position(&settings.xy_device)
            .unwrap_or((0.0, 0.0));
        let anchor = XyPosition::new(0, 0, stage_x, stage_y);
        let acq = Acquisition::create_with_queue_cap(
            0,
            settings,
            vec![anchor],
            ctx,
            EXPLORE_QUEUE_CAP,
        )?;
        Ok(Arc::new(Self { acq }))
    }

    pub fn acquisition(&self) -> &Arc<Acquisition> {
        &self.acq
    }

    pub fn storage(&self) -> &Arc<PyramidStorage> {
        &self.acq.storage
    }

    pub fn name(&self) -> &str {
        self.acq.name()
    }

    /// Queue capture events for every tile in the given grid span, at
    /// every slice in `slices`, for all active channels.
    ///
    /// Positions that do not exist yet are created in the arena. Blocks
    /// when the queue is full; returns [`Aborted`] after an abort.
    pub fn acquire_tiles(
        &self,
        rows: RangeInclusive<i64>,
        cols: RangeInclusive<i64>,
        time_index: usize,
        slices: RangeInclusive<i64>,
    ) -> Result<(), Aborted> {
        let mut cells = Vec::new();
        for row in rows {
            for col in cols.clone() {
                cells.push((row, col));
            }
        }

        let (indices, positions): (Vec<usize>, Vec<XyPosition>) =
            self.acq.storage.with_positions(|arena| {
                let indices = arena.get_or_create(&cells);
                let positions = indices
                    .iter()
                    .filter_map(|&i| arena.get(i).copied())
                    .collect();
                (indices, positions)
            });

        let settings = &self.acq.settings;
        for (i, &position_index) in indices.iter().enumerate() {
            for slice in slices.clone() {
                let z = self.acq.z_origin + slice as f64 * settings.z_step_um;
                for (channel_index, channel) in settings.channels.iter().enumerate() {
                    if !channel.active || !channel.unique_event {
                        continue;
                    }
                    self.acq.note_slice(slice);
                    self.acq.queue.put(AcquisitionEvent::capture(
                        self.acq.index,
                        time_index,
                        channel_index,
                        slice,
                        position_index,
                        z,
                        positions[i],
                        Arc::clone(&settings.covariants),
                    ))?;
                }
            }
        }
        Ok(())
    }

    /// No more exploring: deliver the acquisition-finished marker (which
    /// finalizes storage) and stop the engine task.
    pub fn finish(&self) -> Result<(), Aborted> {
        if !self.acq.finish_event_sent.swap(true, Ordering::AcqRel) {
            self.acq
                .queue
                .put(AcquisitionEvent::acquisition_finished(self.acq.index))?;
        }
        self.acq.mark_finished_generating();
        self.acq
            .queue
            .put(AcquisitionEvent::engine_task_finished())?;
        Ok(())
    }

    /// Abort: discard queued tile requests and end the task. The single
    /// finished marker is still delivered.
    pub fn abort(&self) {
        self.acq.request_abort();
        self.acq.queue.clear_in_reverse();
        if !self.acq.finish_event_sent.swap(true, Ordering::AcqRel) {
            self.acq
                .queue
                .force_put(AcquisitionEvent::acquisition_finished(self.acq.index));
        }
        self.acq.mark_finished_generating();
        self.acq
            .queue
            .force_put(AcquisitionEvent::engine_task_finished());
    }

    /// Block until the sink has finalized storage.
    pub fn wait_done(&self) {
        self.acq.sink.wait_done();
    }
}
