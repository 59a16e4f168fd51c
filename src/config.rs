//! Configuration management for the tilescope binary.
//!
//! Command-line arguments via clap, with environment-variable fallbacks
//! under the `TILESCOPE_` prefix and a `validate()` pass that rejects bad
//! settings before anything touches the hardware or the disk.
//!
//! # Example
//!
//! ```bash
//! tilescope run --dir /data/acq --name overnight --rows 3 --cols 5 \
//!     --time-points 4 --interval-ms 1000 --z-start 0 --z-end 10 --z-step 2
//! tilescope info /data/acq/overnight_1
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

// =============================================================================
// Default Values
// =============================================================================

/// Default simulated camera frame width in pixels.
pub const DEFAULT_FRAME_WIDTH: u32 = 256;

/// Default simulated camera frame height in pixels.
pub const DEFAULT_FRAME_HEIGHT: u32 = 256;

/// Default pixel size in micrometers.
pub const DEFAULT_PIXEL_SIZE_UM: f64 = 0.5;

// =============================================================================
// CLI
// =============================================================================

/// Tilescope - a microscope acquisition engine with pyramidal tile storage.
#[derive(Parser, Debug)]
#[command(name = "tilescope")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated acquisition and write a pyramid data set.
    Run(RunConfig),

    /// Inspect an acquisition directory on disk.
    Info(InfoConfig),
}

// =============================================================================
// Run
// =============================================================================

#[derive(Parser, Debug, Clone)]
pub struct RunConfig {
    /// Root directory for acquisition data sets.
    #[arg(long, env = "TILESCOPE_DIR")]
    pub dir: PathBuf,

    /// Acquisition name; the data set lands in `<dir>/<name>_<n>`.
    #[arg(long, default_value = "acquisition", env = "TILESCOPE_NAME")]
    pub name: String,

    /// Tile grid rows.
    #[arg(long, default_value_t = 2)]
    pub rows: u32,

    /// Tile grid columns.
    #[arg(long, default_value_t = 2)]
    pub cols: u32,

    /// Number of timepoints.
    #[arg(long, default_value_t = 1)]
    pub time_points: usize,

    /// Interval between timepoint starts, milliseconds.
    #[arg(long, default_value_t = 0.0)]
    pub interval_ms: f64,

    /// Z stack start, micrometers. Omit both z-start and z-end for a
    /// single-plane acquisition.
    #[arg(long)]
    pub z_start: Option<f64>,

    /// Z stack end, micrometers.
    #[arg(long)]
    pub z_end: Option<f64>,

    /// Z step, micrometers.
    #[arg(long, default_value_t = 1.0)]
    pub z_step: f64,

    /// Comma-separated channel names.
    #[arg(long, default_value = "C0", value_delimiter = ',')]
    pub channels: Vec<String>,

    /// Inter-tile overlap in pixels (applied in both axes).
    #[arg(long, default_value_t = 0)]
    pub overlap: u32,

    /// Simulated camera frame width.
    #[arg(long, default_value_t = DEFAULT_FRAME_WIDTH, env = "TILESCOPE_FRAME_WIDTH")]
    pub frame_width: u32,

    /// Simulated camera frame height.
    #[arg(long, default_value_t = DEFAULT_FRAME_HEIGHT, env = "TILESCOPE_FRAME_HEIGHT")]
    pub frame_height: u32,

    /// Bytes per pixel sample (1 or 2).
    #[arg(long, default_value_t = 1)]
    pub byte_depth: u8,

    /// Pixel size in micrometers.
    #[arg(long, default_value_t = DEFAULT_PIXEL_SIZE_UM)]
    pub pixel_size_um: f64,

    /// Estimate per-channel background from the first image so sparse
    /// regions render as tissue-colored instead of black.
    #[arg(long, default_value_t = false)]
    pub estimate_background: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl RunConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("acquisition name must not be empty".to_string());
        }
        if self.rows == 0 || self.cols == 0 {
            return Err("grid must have at least one row and one column".to_string());
        }
        if self.z_start.is_some() != self.z_end.is_some() {
            return Err("z-start and z-end must be given together".to_string());
        }
        if let (Some(start), Some(end)) = (self.z_start, self.z_end) {
            if end < start {
                return Err(format!("z range is inverted: {start} to {end}"));
            }
            if self.z_step <= 0.0 {
                return Err("z-step must be positive".to_string());
            }
        }
        if self.channels.is_empty() {
            return Err("at least one channel is required".to_string());
        }
        if self.byte_depth != 1 && self.byte_depth != 2 {
            return Err(format!("byte-depth must be 1 or 2, got {}", self.byte_depth));
        }
        if self.overlap * 2 >= self.frame_width || self.overlap * 2 >= self.frame_height {
            return Err("overlap leaves no tile payload".to_string());
        }
        if self.time_points == 0 {
            return Err("time-points must be at least 1".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Info
// =============================================================================

#[derive(Parser, Debug, Clone)]
pub struct InfoConfig {
    /// Acquisition directory (the one containing "Full resolution").
    pub dir: PathBuf,

    /// Also list every image label.
    #[arg(long, default_value_t = false)]
    pub labels: bool,
}

// =============================================================================
// Tests
// =============================================================================
