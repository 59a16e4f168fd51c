//! Per-acquisition event generation.
//!
//! One thread per acquisition walks timepoint -> position -> slice ->
//! channel and feeds the bounded event queue. Between timepoints the
//! generator blocks until three things line up: the configured interval
//! has elapsed, the scheduler granted the next timepoint, and the sink
//! reported the previous timepoint's images durably written.
//!
//! Every blocking call checks the cooperative abort flag first; detection
//! unwinds through [`Aborted`], and the unwind path still delivers the
//! acquisition-finished marker exactly once.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info};

use crate::error::Aborted;

use super::event::AcquisitionEvent;
use super::group::AcquisitionGroup;
use super::Acquisition;

/// Spawn the generator thread for one acquisition in a group.
pub(crate) fn spawn(acq: Arc<Acquisition>, group: Arc<AcquisitionGroup>) -> JoinHandle<()> {
    let name = format!("{}: event generator", acq.settings.name);
    thread::Builder::new()
        .name(name)
        .spawn(move || match generate(&acq, &group) {
            Ok(()) => debug!("{}: event generation complete", acq.settings.name),
            Err(Aborted) => {
                info!("{}: aborting event generation", acq.settings.name);
                // Discard whatever the engine has not consumed, back to
                // front since it may still be draining the front
                acq.queue.clear_in_reverse();
                if !acq.finish_event_sent.swap(true, std::sync::atomic::Ordering::AcqRel) {
                    acq.queue
                        .force_put(AcquisitionEvent::acquisition_finished(acq.index));
                }
                acq.mark_finished_generating();
                group.acquisition_aborted(acq.index);
            }
        })
        .expect("failed to spawn generator thread")
}

fn generate(acq: &Acquisition, group: &AcquisitionGroup) -> Result<(), Aborted> {
    let num_frames = acq.settings.num_frames();
    let mut next_tp_start = Instant::now();
    // (time index, position index) of the last emitted capture, for
    // resuming a timepoint after a settings change
    let mut last_generated: Option<(usize, usize)> = None;

    for time_index in 0..num_frames {
        acq.check_abort()?;
        pause_until_ready(acq, next_tp_start)?;
        acq.check_abort()?;

        emit_autofocus(acq, time_index)?;

        next_tp_start = Instant::now()
            + Duration::from_millis(acq.settings.interval_ms.max(0.0) as u64);

        loop {
            generate_timepoint(acq, time_index, &mut last_generated)?;

            // Block until the sink confirms this timepoint's images are
            // on disk; a settings change also wakes this wait and sends
            // the loop back to regenerate
            let flushed = loop {
                acq.wait_tp_wake();
                acq.check_abort()?;
                if acq.take_tp_flushed() {
                    break true;
                }
                if acq.settings_changed_pending() {
                    break false;
                }
            };
            if flushed {
                break;
            }
        }

        if time_index == num_frames - 1 {
            acq.mark_finished_generating();
        }
        // Hand the engine to the next acquisition in the group; autofocus
        // correlation (external) runs after this point, once images are
        // safely on disk
        group.finished_timepoint(acq.index);
    }
    Ok(())
}

/// Wait out the timepoint interval, then wait for the scheduler's grant.
/// Both conditions are required before generation proceeds.
fn pause_until_ready(acq: &Acquisition, deadline: Instant) -> Result<(), Aborted> {
    let now = Instant::now();
    if deadline > now {
        match acq.shutdown_rx.recv_timeout(deadline - now) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Err(Aborted),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    acq.ready.wait();
    acq.check_abort()
}

/// Emit the focus-adjustment event at the start of a timepoint.
///
/// Early timepoints apply the configured initial position; later ones ask
/// the advisor, which has had images to correlate against.
fn emit_autofocus(acq: &Acquisition, time_index: usize) -> Result<(), Aborted> {
    let Some(af) = &acq.settings.autofocus else {
        return Ok(());
    };
    let target = if time_index > 1 {
        af.advisor
            .as_ref()
            .and_then(|advisor| advisor.position(time_index))
    } else {
        af.initial_position
    };
    if let Some(z_um) = target {
        acq.queue.put(AcquisitionEvent::autofocus_adjustment(
            acq.index,
            &af.z_device,
            z_um,
        ))?;
    }
    Ok(())
}

/// Emit all capture events of one timepoint, then its end marker.
///
/// A settings change observed after an enqueue discards the pending tail
/// in reverse and restarts from the position that was being generated.
fn generate_timepoint(
    acq: &Acquisition,
    time_index: usize,
    last_generated: &mut Option<(usize, usize)>,
) -> Result<(), Aborted> {
    let settings = &acq.settings;
    let space = &settings.space;

    'restart: loop {
        // Continue an interrupted timepoint from its last position
        let mut position_index = match *last_generated {
            Some((t, p)) if t == time_index => p,
            _ => 0,
        };

        while position_index < acq.positions.len() {
            acq.check_abort()?;
            let position = acq.positions[position_index];

            // The top coordinate can move between positions when a
            // surface is edited mid-acquisition
            let z_top = space.z_top(acq.z_origin, settings.z_limits);
            let mut slice_index =
                ((z_top - acq.z_origin) / settings.z_step_um).round() as i64;

            loop {
                acq.check_abort()?;
                let z = acq.z_origin + slice_index as f64 * settings.z_step_um;

                if space.is_2d() && slice_index > 0 {
                    break;
                }
                if space.volume_undefined_at(&position) {
                    break;
                }
                let past_upper_limit =
                    settings.z_limits.is_some_and(|(_, upper)| z > upper);
                if space.z_below_volume(&position, z, acq.z_origin) || past_upper_limit {
                    break;
                }
                let past_lower_limit =
                    settings.z_limits.is_some_and(|(lower, _)| z < lower);
                if space.z_above_volume(&position, z, acq.z_origin) || past_lower_limit {
                    slice_index += 1;
                    continue;
                }

                for (channel_index, channel) in settings.channels.iter().enumerate() {
                    if !channel.active || !channel.unique_event {
                        continue;
                    }
                    acq.check_abort()?;
                    acq.note_slice(slice_index);
                    acq.queue.put(AcquisitionEvent::capture(
                        acq.index,
                        time_index,
                        channel_index,
                        slice_index,
                        position_index,
                        z,
                        position,
                        Arc::clone(&settings.covariants),
                    ))?;
                    *last_generated = Some((time_index, position_index));

                    if acq.take_settings_changed() {
                        acq.queue.clear_in_reverse();
                        continue 'restart;
                    }
                }
                slice_index += 1;
            }
            position_index += 1;
        }

        // End-of-timepoint marker; the final timepoint carries the
        // acquisition-finished marker instead, never both
        if time_index == settings.num_frames() - 1 {
            acq.queue
                .put(AcquisitionEvent::acquisition_finished(acq.index))?;
            acq.finish_event_sent
                .store(true, std::sync::atomic::Ordering::Release);
        } else {
            acq.queue
                .put(AcquisitionEvent::timepoint_finished(acq.index))?;
        }
        acq.check_abort()?;
        return Ok(());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acq::event::Special;
    use crate::acq::{AcquisitionContext, AcquisitionSettings, SpaceMode};
    use crate::coords::{AffineTransform, PlanarSurface, XyPosition};
    use crate::hardware::SimulatedHardware;

    fn context(root: &std::path::Path) -> AcquisitionContext {
        AcquisitionContext {
            hardware: Arc::new(SimulatedHardware::new(8, 8, 1)),
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

    fn stack_settings(name: &str, time_points: usize) -> AcquisitionSettings {
        let mut settings = AcquisitionSettings::region_2d(name);
        settings.space = SpaceMode::SimpleStack {
            z_start: 0.0,
            z_end: 2.0,
        };
        settings.z_step_um = 1.0;
        settings.time_enabled = time_points > 1;
        settings.num_time_points = time_points;
        settings
    }

    fn positions(count: i64) -> Vec<XyPosition> {
        (0..count)
            .map(|c| XyPosition::new(0, c, c as f64 * 8.0, 0.0))
            .collect()
    }

    fn drain(acq: &Acquisition) -> Vec<AcquisitionEvent> {
        let mut events = Vec::new();
        while let Some(event) = acq.queue.try_take() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_timepoint_walk_order() {
        let root = tempfile::tempdir().unwrap();
        let acq = Acquisition::create_with_queue_cap(
            0,
            stack_settings("walk", 2),
            positions(2),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let events = drain(&acq);

        // 2 positions x 3 slices x 1 channel, then the timepoint marker
        assert_eq!(events.len(), 7);
        let captures: Vec<_> = events.iter().filter(|e| e.is_capture()).collect();
        assert_eq!(captures.len(), 6);

        // Position-major, slice-minor, increasing
        let walk: Vec<(usize, i64)> = captures
            .iter()
            .map(|e| (e.position_index, e.slice_index))
            .collect();
        assert_eq!(walk, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        for c in &captures {
            assert_eq!(c.z_um, c.slice_index as f64);
        }
        assert_eq!(events.last().unwrap().special, Special::TimepointFinished);
    }

    #[test]
    fn test_exactly_one_end_marker_per_timepoint() {
        let root = tempfile::tempdir().unwrap();
        let acq = Acquisition::create_with_queue_cap(
            0,
            stack_settings("markers", 2),
            positions(1),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let tp0: Vec<Special> = drain(&acq).iter().map(|e| e.special).collect();
        assert_eq!(
            tp0.iter()
                .filter(|s| **s == Special::TimepointFinished)
                .count(),
            1
        );
        assert!(!tp0.contains(&Special::AcquisitionFinished));

        // Final timepoint carries the acquisition marker instead
        generate_timepoint(&acq, 1, &mut last).unwrap();
        let tp1: Vec<Special> = drain(&acq).iter().map(|e| e.special).collect();
        assert_eq!(
            tp1.iter()
                .filter(|s| **s == Special::AcquisitionFinished)
                .count(),
            1
        );
        assert!(!tp1.contains(&Special::TimepointFinished));
    }

    #[test]
    fn test_inactive_channels_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = stack_settings("channels", 1);
        settings.channels = vec![
            crate::acq::ChannelSettings::new("on", "FW", "Label", "on"),
            {
                let mut off = crate::acq::ChannelSettings::new("off", "FW", "Label", "off");
                off.active = false;
                off
            },
            {
                let mut shared =
                    crate::acq::ChannelSettings::new("shared", "FW", "Label", "shared");
                shared.unique_event = false;
                shared
            },
        ];
        let acq = Acquisition::create_with_queue_cap(
            0,
            settings,
            positions(1),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let captures: Vec<_> = drain(&acq).into_iter().filter(|e| e.is_capture()).collect();
        assert_eq!(captures.len(), 3, "3 slices, only channel 0 emits");
        assert!(captures.iter().all(|e| e.channel_index == 0));
    }

    #[test]
    fn test_2d_mode_emits_single_slice() {
        let root = tempfile::tempdir().unwrap();
        let acq = Acquisition::create_with_queue_cap(
            0,
            AcquisitionSettings::region_2d("plane"),
            positions(3),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let captures: Vec<_> = drain(&acq).into_iter().filter(|e| e.is_capture()).collect();
        assert_eq!(captures.len(), 3, "one slice per position");
        assert!(captures.iter().all(|e| e.slice_index == 0));
    }

    #[test]
    fn test_surface_mode_skips_undefined_positions() {
        struct HalfPlane;
        impl crate::coords::Surface for HalfPlane {
            fn defined_at(&self, pos: &XyPosition) -> bool {
                pos.grid_col == 0
            }
            fn completely_above(&self, _pos: &XyPosition, z: f64) -> bool {
                z < 5.0
            }
            fn completely_below(&self, _pos: &XyPosition, z: f64) -> bool {
                z > 5.0
            }
            fn z_extent(&self) -> (f64, f64) {
                (5.0, 5.0)
            }
        }

        let root = tempfile::tempdir().unwrap();
        let mut settings = stack_settings("surface", 1);
        settings.space = SpaceMode::FixedSurface {
            surface: Arc::new(HalfPlane),
            distance_above_um: 1.0,
            distance_below_um: 1.0,
        };
        let acq = Acquisition::create_with_queue_cap(
            0,
            settings,
            positions(2),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let captures: Vec<_> = drain(&acq).into_iter().filter(|e| e.is_capture()).collect();
        // Volume spans z 4..=6, 3 slices, only at the defined column
        assert_eq!(captures.len(), 3);
        assert!(captures.iter().all(|e| e.position_index == 0));
    }

    #[test]
    fn test_z_limits_clamp_stack() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = stack_settings("limits", 1);
        settings.space = SpaceMode::FixedSurface {
            surface: Arc::new(PlanarSurface::new(5.0)),
            distance_above_um: 4.0,
            distance_below_um: 4.0,
        };
        // Volume spans 1..=9; the focus drive only travels 3..=7
        settings.z_limits = Some((3.0, 7.0));
        let acq = Acquisition::create_with_queue_cap(
            0,
            settings,
            positions(1),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let captures: Vec<_> = drain(&acq).into_iter().filter(|e| e.is_capture()).collect();
        let z_values: Vec<f64> = captures.iter().map(|e| e.z_um).collect();
        assert!(z_values.iter().all(|z| (3.0..=7.0).contains(z)), "{z_values:?}");
        assert_eq!(z_values.len(), 5);
    }

    #[test]
    fn test_settings_change_discards_and_resumes_from_last_position() {
        let root = tempfile::tempdir().unwrap();
        let acq = Acquisition::create_with_queue_cap(
            0,
            stack_settings("resume", 2),
            positions(3),
            &context(root.path()),
            100,
        )
        .unwrap();

        let mut last = None;
        generate_timepoint(&acq, 0, &mut last).unwrap();
        drain(&acq);
        assert_eq!(last, Some((0, 2)));

        // A surface edit arrives; regeneration resumes from position 2,
        // discarding whatever it had queued before the flag was seen
        acq.notify_settings_changed();
        generate_timepoint(&acq, 0, &mut last).unwrap();
        let events = drain(&acq);
        let captures: Vec<_> = events.iter().filter(|e| e.is_capture()).collect();
        assert!(captures.iter().all(|e| e.position_index == 2));
        assert_eq!(captures.len(), 3, "position 2 regenerated in full");
        assert_eq!(events.last().unwrap().special, Special::TimepointFinished);
    }

    #[test]
    fn test_abort_fails_enqueue() {
        let root = tempfile::tempdir().unwrap();
        let acq = Acquisition::create_with_queue_cap(
            0,
            stack_settings("abort", 1),
            positions(2),
            &context(root.path()),
            100,
        )
        .unwrap();

        acq.request_abort();
        let mut last = None;
        assert_eq!(
            generate_timepoint(&acq, 0, &mut last),
            Err(Aborted),
            "abort observed before any blocking enqueue"
        );
        assert!(acq.queue.is_empty());
    }
}
