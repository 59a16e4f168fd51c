//! # Tilescope
//!
//! A multi-dimensional microscope acquisition engine with multi-resolution
//! pyramidal tile storage.
//!
//! Tilescope schedules hardware moves and image captures across time, Z,
//! channel, and XY-position axes, and persists the resulting images into a
//! durable, randomly-accessible image pyramid on disk.
//!
//! ## Architecture
//!
//! - [`acq`] - event generation, group scheduling, the hardware-execution
//!   loop, and per-acquisition image sinks
//! - [`hardware`] - the hardware capability trait, bounded-retry wrapper,
//!   and a simulated implementation for tests and demos
//! - [`coords`] - stage positions, the multi-resolution position arena,
//!   and the surface capability trait
//! - [`storage`] - pyramid storage, incremental downsampling, and the
//!   binary tile container codec
//! - [`config`] - CLI and configuration types
//! - [`error`] - error types per domain
//!
//! ## Data flow
//!
//! ```text
//! event generator -> bounded queue -> group scheduler -> engine
//!                                                          |
//!        container codec <- pyramid storage <- image sink <-
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilescope::acq::{
//!     Acquisition, AcquisitionContext, AcquisitionSettings, AcquisitionGroup,
//!     EngineTask, ExecutionEngine,
//! };
//! use tilescope::coords::{AffineTransform, XyPosition};
//! use tilescope::hardware::SimulatedHardware;
//!
//! let hardware = Arc::new(SimulatedHardware::new(512, 512, 1));
//! let ctx = AcquisitionContext {
//!     hardware: hardware.clone(),
//!     frame_width: 512,
//!     frame_height: 512,
//!     byte_depth: 1,
//!     rgb: false,
//!     pixel_size_um: 0.5,
//!     affine: AffineTransform::from_pixel_size(0.5),
//!     storage_root: "/data/acquisitions".into(),
//!     estimate_background: false,
//! };
//!
//! let settings = AcquisitionSettings::region_2d("demo");
//! let positions = vec![XyPosition::new(0, 0, 0.0, 0.0)];
//! let acq = Acquisition::create(0, settings, positions, &ctx).unwrap();
//!
//! let group = AcquisitionGroup::new(vec![acq]);
//! group.start();
//! let engine = ExecutionEngine::new(hardware);
//! engine.spawn(EngineTask::Group(group)).join().unwrap();
//! ```

pub mod acq;
pub mod config;
pub mod coords;
pub mod error;
pub mod hardware;
pub mod storage;

// Re-export commonly used types
pub use acq::{
    Acquisition, AcquisitionContext, AcquisitionEvent, AcquisitionGroup,
    AcquisitionSettings, ChannelSettings, CovariantPairing, EngineTask, ExecutionEngine,
    ExploreAcquisition, FocusAdvisor, SpaceMode, Special,
};
pub use config::{Config, InfoConfig, RunConfig};
pub use coords::{AffineTransform, PlanarSurface, PositionIndex, Surface, XyPosition};
pub use error::{Aborted, AcqError, ConfigError, HardwareError, StorageError, TiffError};
pub use hardware::{CapturedFrame, Hardware, Retrier, SimulatedHardware};
pub use storage::{PixelBuffer, PyramidStorage, SummaryMeta, TaggedImage};
