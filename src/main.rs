//! Tilescope - a microscope acquisition engine with pyramidal tile storage.
//!
//! This binary drives a simulated acquisition end to end (`run`) and
//! inspects finished data sets (`info`).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilescope::acq::{
    Acquisition, AcquisitionContext, AcquisitionGroup, AcquisitionSettings, ChannelSettings,
    EngineTask, ExecutionEngine, SpaceMode,
};
use tilescope::config::{Command, Config, InfoConfig, RunConfig};
use tilescope::coords::{AffineTransform, XyPosition};
use tilescope::hardware::SimulatedHardware;
use tilescope::storage::{meta, PyramidStorage};

fn main() -> ExitCode {
    let config = Config::parse();
    match config.command {
        Command::Run(run) => run_acquisition(run),
        Command::Info(info) => run_info(info),
    }
}

// =============================================================================
// Run Command
// =============================================================================

fn run_acquisition(config: RunConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Output: {}", config.dir.display());
    info!("  Grid: {} x {} tiles", config.rows, config.cols);
    info!(
        "  Frames: {} x {} px, {} byte(s)/sample",
        config.frame_width, config.frame_height, config.byte_depth
    );
    info!("  Timepoints: {}", config.time_points);
    info!("  Channels: {}", config.channels.join(", "));

    let hardware = Arc::new(SimulatedHardware::new(
        config.frame_width,
        config.frame_height,
        config.byte_depth,
    ));
    let ctx = AcquisitionContext {
        hardware: hardware.clone(),
        frame_width: config.frame_width,
        frame_height: config.frame_height,
        byte_depth: config.byte_depth,
        rgb: false,
        pixel_size_um: config.pixel_size_um,
        affine: AffineTransform::from_pixel_size(config.pixel_size_um),
        storage_root: config.dir.clone(),
        estimate_background: config.estimate_background,
    };

    let settings = build_settings(&config);
    let positions = build_positions(&config);

    let acq = match Acquisition::create(0, settings, positions, &ctx) {
        Ok(acq) => acq,
        Err(e) => {
            error!("Failed to set up acquisition: {e}");
            return ExitCode::FAILURE;
        }
    };
    let storage = Arc::clone(acq.storage());
    info!("Writing to {}", storage.disk_location().display());

    let group = AcquisitionGroup::new(vec![acq]);
    group.start();
    let engine = ExecutionEngine::new(hardware);
    let engine_handle = engine.spawn(EngineTask::Group(Arc::clone(&group)));

    if engine_handle.join().is_err() {
        error!("Engine thread panicked");
        return ExitCode::FAILURE;
    }
    group.wait_generators();
    for acq in group.acquisitions() {
        acq.wait_storage_finished();
    }

    info!("");
    info!("Acquisition complete:");
    info!("  Data set: {}", storage.disk_location().display());
    info!("  Images: {}", storage.image_labels().len());
    info!("  Resolution levels: {}", storage.num_levels());
    ExitCode::SUCCESS
}

fn build_settings(config: &RunConfig) -> AcquisitionSettings {
    let space = match (config.z_start, config.z_end) {
        (Some(z_start), Some(z_end)) => SpaceMode::SimpleStack { z_start, z_end },
        _ => SpaceMode::Region2d,
    };
    let channels = config
        .channels
        .iter()
        .map(|name| ChannelSettings::new(name, "FilterWheel", "Label", name))
        .collect();

    let mut settings = AcquisitionSettings::region_2d(&config.name);
    settings.space = space;
    settings.z_step_um = config.z_step;
    settings.time_enabled = config.time_points > 1;
    settings.num_time_points = config.time_points;
    settings.interval_ms = config.interval_ms;
    settings.channels = channels;
    settings.tile_overlap_x = config.overlap;
    settings.tile_overlap_y = config.overlap;
    settings
}

fn build_positions(config: &RunConfig) -> Vec<XyPosition> {
    let step_x = (config.frame_width - config.overlap) as f64 * config.pixel_size_um;
    let step_y = (config.frame_height - config.overlap) as f64 * config.pixel_size_um;
    let mut positions = Vec::with_capacity((config.rows * config.cols) as usize);
    for row in 0..config.rows as i64 {
        for col in 0..config.cols as i64 {
            positions.push(XyPosition::new(
                row,
                col,
                col as f64 * step_x,
                row as f64 * step_y,
            ));
        }
    }
    positions
}

// =============================================================================
// Info Command
// =============================================================================

fn run_info(config: InfoConfig) -> ExitCode {
    let storage = match PyramidStorage::open(&config.dir) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Failed to open {}: {e}", config.dir.display());
            return ExitCode::FAILURE;
        }
    };

    let summary = storage.summary();
    println!("Data set: {}", config.dir.display());
    println!("  Prefix: {}", summary.prefix);
    println!(
        "  Tile: {} x {} px stored ({} x {} px net), {} byte(s)/sample",
        summary.width,
        summary.height,
        storage.tile_width(),
        storage.tile_height(),
        summary.byte_depth
    );
    println!(
        "  Grid: {} rows x {} cols",
        storage.num_rows(),
        storage.num_cols()
    );
    println!("  Resolution levels: {}", storage.num_levels());
    println!(
        "  Channels: {} ({})",
        summary.num_channels,
        summary.channel_names.join(", ")
    );
    if let Some((min, max)) = storage.slice_extent() {
        println!("  Slices: {min}..={max}");
    }
    println!("  Images: {}", storage.image_labels().len());

    if config.labels {
        let mut labels = storage.image_labels();
        labels.sort();
        println!();
        println!("  label (channel_slice_frame_position)");
        for label in labels {
            let position = meta::parse_label(&label)
                .map(|ix| format!("  {label}  -> position {}", ix[3]))
                .unwrap_or_else(|| format!("  {label}"));
            println!("{position}");
        }
    }
    ExitCode::SUCCESS
}

// =============================================================================
// Logging
// =============================================================================

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilescope=debug"
    } else {
        "tilescope=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
