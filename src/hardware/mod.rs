//! Hardware capability layer.
//!
//! The acquisition core never talks to device adapters directly; it goes
//! through the [`Hardware`] trait, a synchronous get/set surface over stage,
//! focus, exposure, named device properties, and busy polling. Exactly one
//! thread (the execution engine) issues commands, which preserves command
//! ordering without locks in the implementations' callers.
//!
//! Real rigs are flaky, so every call site in the engine wraps commands in
//! the bounded-retry loop from [`retry`].

mod retry;
mod sim;

pub use retry::{Retrier, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY};
pub use sim::{HardwareOp, SimulatedHardware};

use bytes::Bytes;

use crate::error::HardwareError;

// =============================================================================
// Captured frames
// =============================================================================

/// One raw frame off the camera.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Raw pixel bytes, row-major
    pub pix: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Bytes per sample (1 or 2)
    pub byte_depth: u8,

    /// Whether samples are RGB triplets
    pub rgb: bool,
}

// =============================================================================
// Hardware trait
// =============================================================================

/// Synchronous hardware capability surface.
///
/// Implementations must be safe to share across threads, but callers must
/// not assume commands from different threads interleave meaningfully; the
/// engine is the only command issuer during an acquisition.
pub trait Hardware: Send + Sync {
    /// Move a focus (Z) drive to an absolute position in micrometers.
    fn set_focus_position(&self, device: &str, z_um: f64) -> Result<(), HardwareError>;

    /// Current position of a focus drive.
    fn focus_position(&self, device: &str) -> Result<f64, HardwareError>;

    /// Move an XY stage to absolute coordinates in micrometers.
    fn set_stage_position(&self, device: &str, x_um: f64, y_um: f64)
        -> Result<(), HardwareError>;

    /// Current coordinates of an XY stage.
    fn stage_position(&self, device: &str) -> Result<(f64, f64), HardwareError>;

    /// Set the camera exposure in milliseconds.
    fn set_exposure(&self, exposure_ms: f64) -> Result<(), HardwareError>;

    /// Current camera exposure.
    fn exposure(&self) -> Result<f64, HardwareError>;

    /// Set a named device property.
    fn set_property(&self, device: &str, property: &str, value: &str)
        -> Result<(), HardwareError>;

    /// Read a named device property.
    fn property(&self, device: &str, property: &str) -> Result<String, HardwareError>;

    /// Whether a device is still executing a command.
    fn is_busy(&self, device: &str) -> Result<bool, HardwareError>;

    /// Expose the sensor and return the frame.
    fn snap_image(&self) -> Result<CapturedFrame, HardwareError>;
}
