//! Execution engine.
//!
//! The single consumer of the merged event stream and the only thread
//! that issues hardware commands. For each capture event it updates only
//! the axes that differ from the previous event (Z, then XY, then
//! channel/exposure, then covariant-driven properties), snaps, tags the
//! image, and hands it to the owning acquisition's sink.
//!
//! Every hardware operation runs under the bounded-retry wrapper:
//! failures are logged and retried, and an operation that exhausts its
//! budget is abandoned while the acquisition continues. Availability over
//! consistency, deliberately; a long unattended run should limp, not die.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::HardwareError;
use crate::hardware::{Hardware, Retrier};
use crate::storage::meta;
use crate::storage::{PixelBuffer, TaggedImage};

use super::event::{AcquisitionEvent, Special};
use super::explore::ExploreAcquisition;
use super::group::AcquisitionGroup;
use super::sink::SinkMessage;
use super::Acquisition;

/// Polls of a busy device before the attempt counts as failed.
const IDLE_POLL_LIMIT: u32 = 500;

/// Delay between busy polls.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(2);

// =============================================================================
// EngineTask
// =============================================================================

/// What the engine is currently driving: a scheduled group of fixed
/// acquisitions, or a manually driven explore acquisition.
pub enum EngineTask {
    Group(Arc<AcquisitionGroup>),
    Explore(Arc<ExploreAcquisition>),
}

impl EngineTask {
    fn next_event(&self) -> AcquisitionEvent {
        match self {
            EngineTask::Group(group) => group.next_event(),
            EngineTask::Explore(explore) => explore.acquisition().queue.take(),
        }
    }

    fn acquisition(&self, index: usize) -> &Arc<Acquisition> {
        match self {
            EngineTask::Group(group) => &group.acquisitions()[index],
            EngineTask::Explore(explore) => explore.acquisition(),
        }
    }
}

// =============================================================================
// ExecutionEngine
// =============================================================================

/// The hardware-execution loop.
pub struct ExecutionEngine {
    hardware: Arc<dyn Hardware>,
    retrier: Retrier,
    last_event: Option<AcquisitionEvent>,
}

impl ExecutionEngine {
    pub fn new(hardware: Arc<dyn Hardware>) -> Self {
        Self::with_retrier(hardware, Retrier::default())
    }

    pub fn with_retrier(hardware: Arc<dyn Hardware>, retrier: Retrier) -> Self {
        Self {
            hardware,
            retrier,
            last_event: None,
        }
    }

    /// Run the engine on its own thread until the task's
    /// engine-task-finished marker arrives.
    pub fn spawn(mut self, task: EngineTask) -> JoinHandle<()> {
        thread::Builder::new()
            .name("acquisition engine".to_string())
            .spawn(move || {
                info!("engine: starting");
                loop {
                    let event = task.next_event();
                    if event.special == Special::EngineTaskFinished {
                        break;
                    }
                    self.handle_event(event, &task);
                }
                info!("engine: task finished");
            })
            .expect("failed to spawn engine thread")
    }

    /// Dispatch one event.
    pub(crate) fn handle_event(&mut self, event: AcquisitionEvent, task: &EngineTask) {
        match event.special {
            Special::Requeue | Special::EngineTaskFinished => {}
            Special::AcquisitionFinished => {
                debug!("engine: acquisition {} finished", event.acq_index);
                task.acquisition(event.acq_index)
                    .sink
                    .send(SinkMessage::AcquisitionFinished);
                self.last_event = None;
            }
            Special::TimepointFinished => {
                task.acquisition(event.acq_index)
                    .sink
                    .send(SinkMessage::TimepointFinished);
            }
            Special::AutofocusAdjustment => {
                if let Some(af) = &event.autofocus {
                    let hardware = Arc::clone(&self.hardware);
                    self.retrier.run_best_effort("setting autofocus position", || {
                        hardware.set_focus_position(&af.z_device, af.z_um)
                    });
                }
            }
            Special::None => {
                self.update_hardware(&event, task);
                self.capture(&event, task);
                self.last_event = Some(event);
            }
        }
    }

    /// Bring the hardware to the event's state, touching only what
    /// changed since the previous event. Z moves before XY; switching
    /// acquisitions invalidates all cached state.
    fn update_hardware(&mut self, event: &AcquisitionEvent, task: &EngineTask) {
        if self
            .last_event
            .as_ref()
            .is_some_and(|last| last.acq_index != event.acq_index)
        {
            self.last_event = None;
        }
        let settings = &task.acquisition(event.acq_index).settings;
        let hardware = Arc::clone(&self.hardware);
        let retrier = self.retrier;
        let last = self.last_event.as_ref();

        let z_changed = last.map_or(true, |l| {
            l.slice_index != event.slice_index || l.position_index != event.position_index
        });
        if z_changed {
            let device = settings.z_device.as_str();
            retrier.run_best_effort("waiting for Z stage", || {
                wait_for_idle(hardware.as_ref(), device)
            });
            retrier.run_best_effort("moving Z stage", || {
                hardware.set_focus_position(device, event.z_um)
            });
            retrier.run_best_effort("waiting for Z stage", || {
                wait_for_idle(hardware.as_ref(), device)
            });
        }

        let xy_changed = last.map_or(true, |l| l.position_index != event.position_index);
        if xy_changed {
            if let Some(xy) = event.xy {
                let device = settings.xy_device.as_str();
                retrier.run_best_effort("waiting for XY stage", || {
                    wait_for_idle(hardware.as_ref(), device)
                });
                retrier.run_best_effort("moving XY stage", || {
                    hardware.set_stage_position(device, xy.stage_x, xy.stage_y)
                });
                retrier.run_best_effort("waiting for XY stage", || {
                    wait_for_idle(hardware.as_ref(), device)
                });
            }
        }

        let channel_changed =
            last.map_or(true, |l| l.channel_index != event.channel_index);
        if channel_changed {
            if let Some(channel) = settings.channels.get(event.channel_index) {
                if channel.active {
                    retrier.run_best_effort("switching channel", || {
                        hardware.set_exposure(channel.exposure_ms)?;
                        hardware.set_property(
                            &channel.device,
                            &channel.property,
                            &channel.value,
                        )
                    });
                }
            }
        }

        for pairing in event.covariants.iter() {
            retrier.run_best_effort("applying covariant pairing", || {
                pairing.apply(hardware.as_ref())
            });
        }
    }

    /// Snap, tag, and forward to the sink. An exhausted capture loses
    /// this tile only.
    fn capture(&mut self, event: &AcquisitionEvent, task: &EngineTask) {
        let hardware = Arc::clone(&self.hardware);
        let Some(frame) = self
            .retrier
            .run_best_effort("snapping image", || hardware.snap_image())
        else {
            return;
        };

        let acq = task.acquisition(event.acq_index);
        let elapsed_ms = acq.elapsed_ms();
        let exposure_ms = acq
            .settings
            .channels
            .get(event.channel_index)
            .map(|c| c.exposure_ms)
            .unwrap_or(0.0);
        let xy = event
            .xy
            .unwrap_or_else(|| crate::coords::XyPosition::new(0, 0, 0.0, 0.0));

        let tags = meta::image_tags(
            event.channel_index as i64,
            event.slice_index,
            event.time_index as i64,
            event.position_index as i64,
            xy.grid_row,
            xy.grid_col,
            event.z_um,
            xy.stage_x,
            xy.stage_y,
            elapsed_ms,
            exposure_ms,
            frame.width,
            frame.height,
        );
        acq.sink.send(SinkMessage::Image(TaggedImage::new(
            PixelBuffer::from_frame(frame),
            tags,
        )));
    }
}

/// Poll a device until it reports idle.
fn wait_for_idle(hardware: &dyn Hardware, device: &str) -> Result<(), HardwareError> {
    for _ in 0..IDLE_POLL_LIMIT {
        if !hardware.is_busy(device)? {
            return Ok(());
        }
        thread::sleep(IDLE_POLL_DELAY);
    }
    Err(HardwareError::Command {
        device: device.to_string(),
        message: "still busy after polling".to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acq::{AcquisitionContext, AcquisitionSettings};
    use crate::coords::{AffineTransform, XyPosition};
    use crate::hardware::{HardwareOp, SimulatedHardware};

    fn context(
        hardware: Arc<SimulatedHardware>,
        root: &std::path::Path,
    ) -> AcquisitionContext {
        AcquisitionContext {
            hardware,
            frame_width: 8,
            frame_height: 8,
            byte_depth: 1,
            rgb: false,
            pixel_size_um: 1.0,
            affine: AffineTransform::from_pixel_size(1.0),
            storage_root: root.to_path_buf(),
            estimate_background: false,
        }
    }

    fn capture_event(
        acq_index: usize,
        channel: usize,
        slice: i64,
        position: usize,
        xy: XyPosition,
    ) -> AcquisitionEvent {
        AcquisitionEvent::capture(
            acq_index,
            0,
            channel,
            slice,
            position,
            slice as f64,
            xy,
            Arc::from([]),
        )
    }

    fn engine_with_task(
        root: &std::path::Path,
    ) -> (Arc<SimulatedHardware>, ExecutionEngine, EngineTask) {
        let hardware = Arc::new(SimulatedHardware::new(8, 8, 1));
        let ctx = context(Arc::clone(&hardware), root);
        let mut settings = AcquisitionSettings::region_2d("ops");
        settings.channels.push(crate::acq::ChannelSettings::new(
            "C1",
            "FilterWheel",
            "Label",
            "C1",
        ));
        let acq = Acquisition::create(
            0,
            settings,
            vec![
                XyPosition::new(0, 0, 0.0, 0.0),
                XyPosition::new(0, 1, 100.0, 0.0),
            ],
            &ctx,
        )
        .unwrap();
        let group = AcquisitionGroup::new(vec![acq]);
        let engine = ExecutionEngine::new(hardware.clone());
        (hardware, engine, EngineTask::Group(group))
    }

    #[test]
    fn test_first_event_touches_all_axes_in_order() {
        let root = tempfile::tempdir().unwrap();
        let (hardware, mut engine, task) = engine_with_task(root.path());

        let xy = XyPosition::new(0, 0, 0.0, 0.0);
        engine.handle_event(capture_event(0, 0, 0, 0, xy), &task);

        let ops = hardware.take_ops();
        assert!(matches!(ops[0], HardwareOp::Focus { .. }), "Z first");
        assert!(matches!(ops[1], HardwareOp::Stage { .. }), "XY second");
        assert!(matches!(ops[2], HardwareOp::Exposure { .. }));
        assert!(matches!(ops[3], HardwareOp::Property { .. }));
        assert!(matches!(ops[4], HardwareOp::Snap));
        assert_eq!(ops.len(), 5);
    }

    #[test]
    fn test_unchanged_axes_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let (hardware, mut engine, task) = engine_with_task(root.path());
        let xy = XyPosition::new(0, 0, 0.0, 0.0);

        engine.handle_event(capture_event(0, 0, 0, 0, xy), &task);
        hardware.take_ops();

        // Next slice, same position and channel: only Z moves
        engine.handle_event(capture_event(0, 0, 1, 0, xy), &task);
        let ops = hardware.take_ops();
        assert!(matches!(ops[0], HardwareOp::Focus { .. }));
        assert!(matches!(ops[1], HardwareOp::Snap));
        assert_eq!(ops.len(), 2);

        // Same slice, new channel: only exposure and channel property
        engine.handle_event(capture_event(0, 1, 1, 0, xy), &task);
        let ops = hardware.take_ops();
        assert!(matches!(ops[0], HardwareOp::Exposure { .. }));
        assert!(matches!(ops[1], HardwareOp::Property { .. }));
        assert!(matches!(ops[2], HardwareOp::Snap));
        assert_eq!(ops.len(), 3);

        // New position: Z and XY both move, channel unchanged
        let xy2 = XyPosition::new(0, 1, 100.0, 0.0);
        engine.handle_event(capture_event(0, 1, 1, 1, xy2), &task);
        let ops = hardware.take_ops();
        assert!(matches!(ops[0], HardwareOp::Focus { .. }));
        assert!(matches!(ops[1], HardwareOp::Stage { x_um, .. } if x_um == 100.0));
        assert!(matches!(ops[2], HardwareOp::Snap));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_requeue_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let (hardware, mut engine, task) = engine_with_task(root.path());
        engine.handle_event(AcquisitionEvent::requeue(0), &task);
        assert!(hardware.take_ops().is_empty());
    }

    #[test]
    fn test_autofocus_event_moves_named_drive_only() {
        let root = tempfile::tempdir().unwrap();
        let (hardware, mut engine, task) = engine_with_task(root.path());
        engine.handle_event(
            AcquisitionEvent::autofocus_adjustment(0, "AutofocusZ", 7.5),
            &task,
        );
        let ops = hardware.take_ops();
        assert_eq!(ops.len(), 1);
        assert!(
            matches!(&ops[0], HardwareOp::Focus { device, z_um } if device == "AutofocusZ" && *z_um == 7.5)
        );
    }

    #[test]
    fn test_capture_survives_transient_faults() {
        let root = tempfile::tempdir().unwrap();
        let (hardware, mut engine, task) = engine_with_task(root.path());
        let xy = XyPosition::new(0, 0, 0.0, 0.0);

        // Two transient faults are absorbed by the retry loop
        hardware.inject_failures(2);
        engine.handle_event(capture_event(0, 0, 0, 0, xy), &task);
        let ops = hardware.take_ops();
        assert!(matches!(ops.last(), Some(HardwareOp::Snap)));
    }
}
