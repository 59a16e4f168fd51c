//! End-to-end acquisition tests: generator -> scheduler -> engine ->
//! sink -> pyramid storage, all on real threads with simulated hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tilescope::acq::{
    Acquisition, AcquisitionContext, AcquisitionGroup, AcquisitionSettings, ChannelSettings,
    EngineTask, ExecutionEngine, ExploreAcquisition, SpaceMode,
};
use tilescope::coords::{AffineTransform, XyPosition};
use tilescope::hardware::{HardwareOp, SimulatedHardware};
use tilescope::storage::meta;

const FRAME: u32 = 16;

fn context(hardware: Arc<SimulatedHardware>, root: &std::path::Path) -> AcquisitionContext {
    AcquisitionContext {
        hardware,
        frame_width: FRAME,
        frame_height: FRAME,
        byte_depth: 1,
        rgb: false,
        pixel_size_um: 1.0,
        affine: AffineTransform::from_pixel_size(1.0),
        storage_root: root.to_path_buf(),
        estimate_background: false,
    }
}

fn row_positions(count: i64, stage_offset: f64) -> Vec<XyPosition> {
    (0..count)
        .map(|c| XyPosition::new(0, c, stage_offset + c as f64 * 100.0, 0.0))
        .collect()
}

fn settings(name: &str, time_points: usize) -> AcquisitionSettings {
    let mut settings = AcquisitionSettings::region_2d(name);
    settings.time_enabled = time_points > 1;
    settings.num_time_points = time_points;
    settings.interval_ms = 0.0;
    settings
}

fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Single acquisition
// =============================================================================

#[test]
fn test_single_acquisition_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    let mut s = settings("solo", 2);
    s.space = SpaceMode::SimpleStack {
        z_start: 0.0,
        z_end: 2.0,
    };
    s.z_step_um = 1.0;
    s.channels = vec![
        ChannelSettings::new("DAPI", "FilterWheel", "Label", "DAPI"),
        ChannelSettings::new("GFP", "FilterWheel", "Label", "GFP"),
    ];

    let positions: Vec<XyPosition> = (0..2)
        .flat_map(|r| (0..2).map(move |c| XyPosition::new(r, c, c as f64 * 16.0, r as f64 * 16.0)))
        .collect();
    let acq = Acquisition::create(0, s, positions, &ctx).unwrap();
    let storage = Arc::clone(acq.storage());

    let group = AcquisitionGroup::new(vec![acq]);
    group.start();
    ExecutionEngine::new(hardware)
        .spawn(EngineTask::Group(Arc::clone(&group)))
        .join()
        .unwrap();
    group.wait_generators();
    for acq in group.acquisitions() {
        acq.wait_storage_finished();
    }

    // 2 timepoints x 4 positions x 3 slices x 2 channels
    assert_eq!(storage.image_labels().len(), 48);
    assert!(storage.is_finished());
    // 2x2 grid downsamples exactly once
    assert_eq!(storage.num_levels(), 2);

    // Every image carries coherent metadata
    let img = storage.get_image(1, 2, 1, 3, 0).expect("last image present");
    assert_eq!(meta::channel_index(&img.tags), Some(1));
    assert_eq!(meta::slice_index(&img.tags), Some(2));
    assert_eq!(meta::frame_index(&img.tags), Some(1));
    assert_eq!(img.tags["PositionName"], "Grid_1_1");
    assert_eq!(img.pix.width(), FRAME);
}

// =============================================================================
// Round-robin scheduling
// =============================================================================

#[test]
fn test_group_alternates_between_acquisitions() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    // A has 3 positions near stage origin, B has 1 position far away
    let a = Acquisition::create(0, settings("acq-a", 2), row_positions(3, 0.0), &ctx).unwrap();
    let b = Acquisition::create(1, settings("acq-b", 2), row_positions(1, 5000.0), &ctx)
        .unwrap();
    let storage_a = Arc::clone(a.storage());
    let storage_b = Arc::clone(b.storage());

    let group = AcquisitionGroup::new(vec![a, b]);
    group.start();
    ExecutionEngine::new(hardware.clone())
        .spawn(EngineTask::Group(Arc::clone(&group)))
        .join()
        .unwrap();
    group.wait_generators();
    for acq in group.acquisitions() {
        acq.wait_storage_finished();
    }

    // Hardware saw strict A, B, A, B interleaving at timepoint
    // granularity: stage X tells which acquisition issued each move
    let stage_x: Vec<f64> = hardware
        .take_ops()
        .into_iter()
        .filter_map(|op| match op {
            HardwareOp::Stage { x_um, .. } => Some(x_um),
            _ => None,
        })
        .collect();
    assert_eq!(
        stage_x,
        vec![0.0, 100.0, 200.0, 5000.0, 0.0, 100.0, 200.0, 5000.0],
        "no event from an inactive acquisition was ever consumed"
    );

    assert!(group.is_finished());
    assert_eq!(storage_a.image_labels().len(), 6);
    assert_eq!(storage_b.image_labels().len(), 2);
    assert!(storage_a.is_finished());
    assert!(storage_b.is_finished());
}

// =============================================================================
// Abort
// =============================================================================

#[test]
fn test_abort_active_acquisition_terminates_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    // Long interval: after timepoint 0 the generator sleeps, which is
    // where the abort lands
    let mut s = settings("abortable", 5);
    s.interval_ms = 60_000.0;
    let acq = Acquisition::create(0, s, row_positions(2, 0.0), &ctx).unwrap();
    let storage = Arc::clone(acq.storage());

    let group = AcquisitionGroup::new(vec![Arc::clone(&acq)]);
    group.start();
    let engine_handle = ExecutionEngine::new(hardware.clone())
        .spawn(EngineTask::Group(Arc::clone(&group)));

    wait_until("timepoint 0 images", Duration::from_secs(20), || {
        storage.image_labels().len() >= 2
    });
    acq.request_abort();

    // The engine must observe exactly one finished marker and exit
    // without deadlock
    engine_handle.join().unwrap();
    group.wait_generators();
    acq.wait_storage_finished();

    assert!(group.is_finished());
    assert!(storage.is_finished(), "storage finalized on abort");
    assert_eq!(storage.image_labels().len(), 2, "timepoint 0 tiles kept");

    // No hardware commands after the engine exited
    hardware.take_ops();
    std::thread::sleep(Duration::from_millis(100));
    assert!(hardware.take_ops().is_empty());
}

#[test]
fn test_abort_inactive_acquisition_does_not_stall_group() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    let a = Acquisition::create(0, settings("keeper", 3), row_positions(2, 0.0), &ctx).unwrap();
    let b = Acquisition::create(1, settings("victim", 3), row_positions(1, 9000.0), &ctx)
        .unwrap();
    let storage_a = Arc::clone(a.storage());
    let storage_b = Arc::clone(b.storage());

    let group = AcquisitionGroup::new(vec![Arc::clone(&a), Arc::clone(&b)]);

    // B is aborted before the group ever schedules it
    b.request_abort();
    group.start();
    ExecutionEngine::new(hardware)
        .spawn(EngineTask::Group(Arc::clone(&group)))
        .join()
        .unwrap();
    group.wait_generators();
    a.wait_storage_finished();
    b.wait_storage_finished();

    // A ran to completion; B's completion was still observed exactly once
    assert_eq!(storage_a.image_labels().len(), 6);
    assert!(storage_a.is_finished());
    assert!(storage_b.is_finished());
    assert_eq!(storage_b.image_labels().len(), 0);
}

// =============================================================================
// Explore mode
// =============================================================================

#[test]
fn test_explore_acquires_requested_tiles() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    let explore = ExploreAcquisition::create(settings("explore", 1), &ctx).unwrap();
    let storage = Arc::clone(explore.storage());

    // A span that grows the grid into negative rows
    explore.acquire_tiles(-1..=0, 0..=1, 0, 0..=0).unwrap();
    explore.finish().unwrap();

    ExecutionEngine::new(hardware)
        .spawn(EngineTask::Explore(Arc::clone(&explore)))
        .join()
        .unwrap();
    explore.wait_done();

    assert_eq!(storage.image_labels().len(), 4);
    assert!(storage.is_finished());
    assert_eq!(storage.num_rows(), 2);
    assert_eq!(storage.num_cols(), 2);
    // Four tiles spanning two rows force a downsample level
    assert_eq!(storage.num_levels(), 2);
}

#[test]
fn test_explore_abort_discards_queued_tiles() {
    let root = tempfile::tempdir().unwrap();
    let hardware = Arc::new(SimulatedHardware::new(FRAME, FRAME, 1));
    let ctx = context(Arc::clone(&hardware), root.path());

    let explore = ExploreAcquisition::create(settings("explore-abort", 1), &ctx).unwrap();
    let storage = Arc::clone(explore.storage());

    explore.acquire_tiles(0..=3, 0..=3, 0, 0..=0).unwrap();
    explore.abort();

    // Engine starts only after the abort: queued tile requests were
    // discarded, the finished marker is still delivered
    ExecutionEngine::new(hardware)
        .spawn(EngineTask::Explore(Arc::clone(&explore)))
        .join()
        .unwrap();
    explore.wait_done();

    assert!(storage.is_finished());
    assert_eq!(storage.image_labels().len(), 0);
}
