use thiserror::Error;

/// Errors returned by the hardware capability layer.
///
/// Individual hardware commands are expected to fail transiently on real
/// rigs (serial hiccups, busy controllers). The engine wraps every command
/// in a bounded-retry loop, so these errors are usually logged and retried
/// rather than propagated.
#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    /// A device rejected or failed a command
    #[error("device '{device}': {message}")]
    Command { device: String, message: String },

    /// A named device does not exist in the hardware configuration
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// A device property does not exist
    #[error("unknown property '{property}' on device '{device}'")]
    UnknownProperty { device: String, property: String },

    /// Image capture failed
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Configuration and validation faults.
///
/// These are rejected synchronously before any event is generated, so a bad
/// setup never creates partial on-disk state.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The space mode requires a surface that was not provided
    #[error("acquisition '{acq}' requires a surface for its space mode")]
    MissingSurface { acq: String },

    /// No XY positions could be derived from the footprint
    #[error("acquisition '{acq}' has no XY positions")]
    NoPositions { acq: String },

    /// No usable channel is enabled
    #[error("acquisition '{acq}' has no active channels")]
    NoActiveChannels { acq: String },

    /// Z step must be positive for stack modes
    #[error("acquisition '{acq}' has invalid z step {z_step}")]
    InvalidZStep { acq: String, z_step: f64 },

    /// A required device name is empty
    #[error("acquisition '{acq}' is missing a {role} device name")]
    MissingDevice { acq: String, role: &'static str },

    /// Generic invalid setting with an explanation
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Errors from the binary tile container codec.
#[derive(Debug, Error)]
pub enum TiffError {
    /// Underlying file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid magic bytes (not II or MM)
    #[error("invalid magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid version number (only classic TIFF is written)
    #[error("invalid version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// A structural header word did not match its expected marker
    #[error("corrupt header: expected marker {expected:#x}, got {actual:#x}")]
    BadHeaderMarker { expected: u32, actual: u32 },

    /// A required tag is missing from an image directory
    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    /// No image with the requested label exists in this container
    #[error("unknown image label: {0}")]
    UnknownLabel(String),

    /// Write would cross the 4 GB classic-TIFF offset ceiling
    #[error("container full: write of {requested} bytes would exceed the 4 GB offset limit")]
    ContainerFull { requested: usize },

    /// Pixel data does not match the geometry recorded for this container
    #[error("pixel strip length mismatch: expected {expected} bytes, got {actual}")]
    StripLengthMismatch { expected: u64, actual: u64 },

    /// The container has been finished and is read-only
    #[error("container is finished and read-only")]
    Finished,

    /// Metadata document failed to serialize or parse
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The background writer thread is gone
    #[error("writer thread terminated unexpectedly")]
    WriterGone,
}

/// Errors from the multi-resolution pyramid storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Container codec failure
    #[error("container error: {0}")]
    Tiff(#[from] TiffError),

    /// Underlying file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The data set has been finished and no longer accepts images
    #[error("data set is finished and read-only")]
    Finished,

    /// The requested resolution level does not exist
    #[error("resolution level {0} does not exist")]
    MissingLevel(usize),

    /// An image's metadata document is missing a required field
    #[error("image metadata missing field: {0}")]
    MissingMetadata(&'static str),
}

/// Errors surfaced when assembling or starting an acquisition.
#[derive(Debug, Error)]
pub enum AcqError {
    /// Settings rejected before any event was generated
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage could not be created
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Distinguished cancellation outcome.
///
/// Raised when an abort request is observed at a blocking wait. It unwinds
/// the generator and engine loops; it is never swallowed silently, and the
/// abort path still enqueues a well-formed acquisition-finished marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("acquisition aborted")]
pub struct Aborted;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = HardwareError::Command {
            device: "ZStage".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(e.to_string(), "device 'ZStage': timeout");

        let e = TiffError::InvalidMagic(0x0000);
        assert!(e.to_string().contains("0x0000"));

        let e = StorageError::MissingLevel(3);
        assert!(e.to_string().contains('3'));
    }

    #[test]
    fn test_tiff_error_into_storage_error() {
        let tiff = TiffError::MissingTag("StripOffsets");
        let storage: StorageError = tiff.into();
        assert!(matches!(storage, StorageError::Tiff(_)));
    }
}
