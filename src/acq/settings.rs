//! Acquisition settings: space modes, channels, covariants, autofocus.

use std::fmt;
use std::sync::Arc;

use crate::coords::{Surface, XyPosition};
use crate::error::{ConfigError, HardwareError};
use crate::hardware::Hardware;
use crate::storage::meta::{position_document, SummaryMeta};

// =============================================================================
// Channels
// =============================================================================

/// One acquisition channel.
///
/// Switching channels is modeled as setting one named device property
/// (filter wheel label, light path preset) plus the exposure.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub name: String,

    /// Device carrying the channel-selection property
    pub device: String,

    /// Property set when this channel becomes current
    pub property: String,

    /// Property value selecting this channel
    pub value: String,

    pub exposure_ms: f64,

    /// Deselected channels are skipped by the generator
    pub active: bool,

    /// Channels sharing another channel's exposure emit no event of
    /// their own
    pub unique_event: bool,

    /// Display color, packed 0xRRGGBB
    pub color: u32,
}

impl ChannelSettings {
    pub fn new(name: &str, device: &str, property: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            property: property.to_string(),
            value: value.to_string(),
            exposure_ms: 10.0,
            active: true,
            unique_event: true,
            color: 0xFFFFFF,
        }
    }
}

// =============================================================================
// Covariant pairings
// =============================================================================

/// An externally defined rule tying a dependent device property to an
/// independent one. The engine applies pairings at hardware-update time:
/// read the independent value, look up the closest interpolation point,
/// set the dependent property.
#[derive(Debug, Clone)]
pub struct CovariantPairing {
    pub independent_device: String,
    pub independent_property: String,
    pub dependent_device: String,
    pub dependent_property: String,

    /// (independent value, dependent value) interpolation points
    pub pairings: Vec<(f64, f64)>,
}

impl CovariantPairing {
    /// Read the independent property and drive the dependent one.
    pub fn apply(&self, hardware: &dyn Hardware) -> Result<(), HardwareError> {
        let raw = hardware.property(&self.independent_device, &self.independent_property)?;
        let independent: f64 = raw.parse().map_err(|_| HardwareError::Command {
            device: self.independent_device.clone(),
            message: format!("non-numeric value '{raw}' for {}", self.independent_property),
        })?;

        let Some((_, dependent)) = self
            .pairings
            .iter()
            .min_by(|a, b| {
                let da = (a.0 - independent).abs();
                let db = (b.0 - independent).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
        else {
            return Ok(());
        };
        hardware.set_property(
            &self.dependent_device,
            &self.dependent_property,
            &dependent.to_string(),
        )
    }
}

// =============================================================================
// Space modes
// =============================================================================

/// How the Z extent of a stack is bounded at each XY position.
#[derive(Clone)]
pub enum SpaceMode {
    /// Fixed start/end depths, identical at every position
    SimpleStack { z_start: f64, z_end: f64 },

    /// Fixed distances around one interpolated surface
    FixedSurface {
        surface: Arc<dyn Surface>,
        distance_above_um: f64,
        distance_below_um: f64,
    },

    /// Volume between two surfaces
    VolumeBetween {
        top: Arc<dyn Surface>,
        bottom: Arc<dyn Surface>,
        distance_above_um: f64,
        distance_below_um: f64,
    },

    /// Single plane over a 2-D region
    Region2d,

    /// Single plane at the current stage position
    NoSpace,
}

impl fmt::Debug for SpaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceMode::SimpleStack { z_start, z_end } => f
                .debug_struct("SimpleStack")
                .field("z_start", z_start)
                .field("z_end", z_end)
                .finish(),
            SpaceMode::FixedSurface { .. } => f.write_str("FixedSurface"),
            SpaceMode::VolumeBetween { .. } => f.write_str("VolumeBetween"),
            SpaceMode::Region2d => f.write_str("Region2d"),
            SpaceMode::NoSpace => f.write_str("NoSpace"),
        }
    }
}

impl SpaceMode {
    /// Modes that collect exactly one slice per position.
    pub fn is_2d(&self) -> bool {
        matches!(self, SpaceMode::Region2d | SpaceMode::NoSpace)
    }

    /// Whether no imaging volume exists at this position at all.
    pub fn volume_undefined_at(&self, pos: &XyPosition) -> bool {
        match self {
            SpaceMode::FixedSurface { surface, .. } => !surface.defined_at(pos),
            SpaceMode::VolumeBetween { top, bottom, .. } => {
                !top.defined_at(pos) && !bottom.defined_at(pos)
            }
            _ => false,
        }
    }

    /// Whether `z` is still above the imaging volume (too shallow); the
    /// slice is skipped without emitting.
    pub fn z_above_volume(&self, pos: &XyPosition, z: f64, z_origin: f64) -> bool {
        match self {
            SpaceMode::FixedSurface {
                surface,
                distance_above_um,
                ..
            } => surface.completely_above(pos, z + distance_above_um),
            SpaceMode::VolumeBetween {
                top,
                distance_above_um,
                ..
            } => top.completely_above(pos, z + distance_above_um),
            SpaceMode::SimpleStack { z_start, .. } => z < *z_start,
            _ => z < z_origin,
        }
    }

    /// Whether `z` is below the imaging volume (too deep); the stack at
    /// this position is finished.
    pub fn z_below_volume(&self, pos: &XyPosition, z: f64, z_origin: f64) -> bool {
        match self {
            SpaceMode::FixedSurface {
                surface,
                distance_below_um,
                ..
            } => surface.completely_below(pos, z - distance_below_um),
            SpaceMode::VolumeBetween {
                bottom,
                distance_below_um,
                ..
            } => bottom.completely_below(pos, z - distance_below_um),
            SpaceMode::SimpleStack { z_end, .. } => z > *z_end,
            _ => z > z_origin,
        }
    }

    /// Shallowest Z the acquisition can image; slice index 0 sits here.
    /// `current_z` feeds the plane modes that image wherever the stage is.
    pub fn z_top(&self, current_z: f64, z_limits: Option<(f64, f64)>) -> f64 {
        let top = match self {
            SpaceMode::SimpleStack { z_start, .. } => *z_start,
            SpaceMode::FixedSurface {
                surface,
                distance_above_um,
                ..
            } => surface.z_extent().0 - distance_above_um,
            SpaceMode::VolumeBetween {
                top,
                distance_above_um,
                ..
            } => top.z_extent().0 - distance_above_um,
            SpaceMode::Region2d | SpaceMode::NoSpace => current_z,
        };
        match z_limits {
            Some((lower, _)) => top.max(lower),
            None => top,
        }
    }

    /// Initial slice-count estimate for container pre-sizing.
    pub fn slice_count_estimate(&self, z_step_um: f64) -> u32 {
        let extent = match self {
            SpaceMode::SimpleStack { z_start, z_end } => (z_end - z_start).abs(),
            SpaceMode::FixedSurface {
                surface,
                distance_above_um,
                distance_below_um,
            } => {
                let (top, bottom) = surface.z_extent();
                (bottom - top).abs() + distance_above_um + distance_below_um
            }
            SpaceMode::VolumeBetween {
                top,
                bottom,
                distance_above_um,
                distance_below_um,
            } => {
                let shallowest = top.z_extent().0;
                let deepest = bottom.z_extent().1;
                (deepest - shallowest).abs() + distance_above_um + distance_below_um
            }
            SpaceMode::Region2d | SpaceMode::NoSpace => return 1,
        };
        (extent / z_step_um).ceil().max(1.0) as u32
    }
}

// =============================================================================
// Autofocus
// =============================================================================

/// Supplies the focus correction applied at the start of later timepoints.
/// The correlation math lives outside this crate.
pub trait FocusAdvisor: Send + Sync {
    fn position(&self, time_index: usize) -> Option<f64>;
}

/// Autofocus configuration for an acquisition.
#[derive(Clone)]
pub struct AutofocusSettings {
    /// Focus drive adjusted between timepoints
    pub z_device: String,

    /// Position applied on the first timepoints, before the advisor has
    /// anything to correlate against
    pub initial_position: Option<f64>,

    pub advisor: Option<Arc<dyn FocusAdvisor>>,
}

impl fmt::Debug for AutofocusSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutofocusSettings")
            .field("z_device", &self.z_device)
            .field("initial_position", &self.initial_position)
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

// =============================================================================
// AcquisitionSettings
// =============================================================================

/// Full configuration of one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub name: String,

    pub time_enabled: bool,
    pub num_time_points: usize,
    pub interval_ms: f64,

    pub space: SpaceMode,
    pub z_step_um: f64,

    pub z_device: String,
    pub xy_device: String,

    /// Focus-drive travel limits, when the stage reports them
    pub z_limits: Option<(f64, f64)>,

    pub channels: Vec<ChannelSettings>,
    pub covariants: Arc<[CovariantPairing]>,
    pub autofocus: Option<AutofocusSettings>,

    /// Inter-tile overlap baked into full-resolution tiles, pixels
    pub tile_overlap_x: u32,
    pub tile_overlap_y: u32,
}

impl AcquisitionSettings {
    /// Minimal settings for a single-timepoint 2-D acquisition.
    pub fn region_2d(name: &str) -> Self {
        Self {
            name: name.to_string(),
            time_enabled: false,
            num_time_points: 1,
            interval_ms: 0.0,
            space: SpaceMode::Region2d,
            z_step_um: 1.0,
            z_device: "Z".to_string(),
            xy_device: "XY".to_string(),
            z_limits: None,
            channels: vec![ChannelSettings::new("C0", "FilterWheel", "Label", "C0")],
            covariants: Arc::from([]),
            autofocus: None,
            tile_overlap_x: 0,
            tile_overlap_y: 0,
        }
    }

    /// Timepoints this acquisition will run.
    pub fn num_frames(&self) -> usize {
        if self.time_enabled {
            self.num_time_points.max(1)
        } else {
            1
        }
    }

    /// Reject bad settings before any event is generated or any on-disk
    /// state is created.
    pub fn validate(&self, positions: &[XyPosition]) -> Result<(), ConfigError> {
        if positions.is_empty() {
            return Err(ConfigError::NoPositions {
                acq: self.name.clone(),
            });
        }
        if !self.channels.iter().any(|c| c.active && c.unique_event) {
            return Err(ConfigError::NoActiveChannels {
                acq: self.name.clone(),
            });
        }
        if !self.space.is_2d() && self.z_step_um <= 0.0 {
            return Err(ConfigError::InvalidZStep {
                acq: self.name.clone(),
                z_step: self.z_step_um,
            });
        }
        if self.z_device.is_empty() {
            return Err(ConfigError::MissingDevice {
                acq: self.name.clone(),
                role: "focus",
            });
        }
        if self.xy_device.is_empty() {
            return Err(ConfigError::MissingDevice {
                acq: self.name.clone(),
                role: "XY stage",
            });
        }
        if let SpaceMode::SimpleStack { z_start, z_end } = self.space {
            if z_end < z_start {
                return Err(ConfigError::Invalid(format!(
                    "z range of '{}' is inverted: {z_start} to {z_end}",
                    self.name
                )));
            }
        }
        if let Some(af) = &self.autofocus {
            if af.z_device.is_empty() {
                return Err(ConfigError::MissingDevice {
                    acq: self.name.clone(),
                    role: "autofocus",
                });
            }
        }
        Ok(())
    }

    /// Summary metadata for this acquisition's containers.
    #[allow(clippy::too_many_arguments)]
    pub fn summary(
        &self,
        frame_width: u32,
        frame_height: u32,
        byte_depth: u8,
        rgb: bool,
        pixel_size_um: f64,
        affine: &str,
        positions: &[XyPosition],
    ) -> SummaryMeta {
        SummaryMeta {
            prefix: self.name.clone(),
            width: frame_width,
            height: frame_height,
            byte_depth,
            rgb,
            num_channels: self.channels.len().max(1) as u32,
            channel_names: self.channels.iter().map(|c| c.name.clone()).collect(),
            channel_colors: self.channels.iter().map(|c| c.color).collect(),
            num_frames: self.num_frames() as u32,
            num_slices: self.space.slice_count_estimate(self.z_step_um),
            pixel_size_um,
            z_step_um: self.z_step_um,
            interval_ms: self.interval_ms,
            overlap_x: self.tile_overlap_x,
            overlap_y: self.tile_overlap_y,
            affine: affine.to_string(),
            initial_positions: positions
                .iter()
                .map(|p| position_document(p.grid_row, p.grid_col, p.stage_x, p.stage_y))
                .collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::PlanarSurface;

    fn pos() -> XyPosition {
        XyPosition::new(0, 0, 0.0, 0.0)
    }

    #[test]
    fn test_simple_stack_predicates() {
        let space = SpaceMode::SimpleStack {
            z_start: 10.0,
            z_end: 20.0,
        };
        assert!(!space.volume_undefined_at(&pos()));
        assert!(space.z_above_volume(&pos(), 9.0, 0.0));
        assert!(!space.z_above_volume(&pos(), 10.0, 0.0));
        assert!(space.z_below_volume(&pos(), 21.0, 0.0));
        assert!(!space.z_below_volume(&pos(), 20.0, 0.0));
        assert_eq!(space.z_top(0.0, None), 10.0);
        assert_eq!(space.slice_count_estimate(2.0), 5);
    }

    #[test]
    fn test_fixed_surface_predicates() {
        let space = SpaceMode::FixedSurface {
            surface: Arc::new(PlanarSurface::new(50.0)),
            distance_above_um: 5.0,
            distance_below_um: 10.0,
        };
        // Volume spans 45..60
        assert!(space.z_above_volume(&pos(), 44.0, 0.0));
        assert!(!space.z_above_volume(&pos(), 45.0, 0.0));
        assert!(space.z_below_volume(&pos(), 61.0, 0.0));
        assert!(!space.z_below_volume(&pos(), 60.0, 0.0));
        assert_eq!(space.z_top(0.0, None), 45.0);
        assert_eq!(space.slice_count_estimate(1.0), 15);
    }

    #[test]
    fn test_no_space_single_plane() {
        let space = SpaceMode::NoSpace;
        assert!(space.is_2d());
        // The plane sits at the z origin; anything else is outside
        assert!(space.z_above_volume(&pos(), -1.0, 0.0));
        assert!(space.z_below_volume(&pos(), 1.0, 0.0));
        assert!(!space.z_above_volume(&pos(), 0.0, 0.0));
        assert_eq!(space.z_top(33.0, None), 33.0);
        assert_eq!(space.slice_count_estimate(1.0), 1);
    }

    #[test]
    fn test_z_top_respects_stage_limit() {
        let space = SpaceMode::SimpleStack {
            z_start: -100.0,
            z_end: 0.0,
        };
        assert_eq!(space.z_top(0.0, Some((-50.0, 50.0))), -50.0);
    }

    #[test]
    fn test_validation() {
        let settings = AcquisitionSettings::region_2d("a");
        assert!(settings.validate(&[pos()]).is_ok());
        assert!(matches!(
            settings.validate(&[]),
            Err(ConfigError::NoPositions { .. })
        ));

        let mut no_channels = settings.clone();
        no_channels.channels.iter_mut().for_each(|c| c.active = false);
        assert!(matches!(
            no_channels.validate(&[pos()]),
            Err(ConfigError::NoActiveChannels { .. })
        ));

        let mut bad_step = settings.clone();
        bad_step.space = SpaceMode::SimpleStack {
            z_start: 0.0,
            z_end: 10.0,
        };
        bad_step.z_step_um = 0.0;
        assert!(matches!(
            bad_step.validate(&[pos()]),
            Err(ConfigError::InvalidZStep { .. })
        ));

        let mut inverted = settings;
        inverted.space = SpaceMode::SimpleStack {
            z_start: 10.0,
            z_end: 0.0,
        };
        assert!(matches!(
            inverted.validate(&[pos()]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_covariant_apply() {
        use crate::hardware::SimulatedHardware;

        let hardware = SimulatedHardware::new(8, 8, 1);
        hardware.set_property("Laser", "Power", "47.0").unwrap();
        hardware.take_ops();

        let pairing = CovariantPairing {
            independent_device: "Laser".to_string(),
            independent_property: "Power".to_string(),
            dependent_device: "PMT".to_string(),
            dependent_property: "Gain".to_string(),
            pairings: vec![(0.0, 1.0), (50.0, 2.0), (100.0, 3.0)],
        };
        pairing.apply(&hardware).unwrap();
        assert_eq!(hardware.property("PMT", "Gain").unwrap(), "2");
    }

    #[test]
    fn test_summary_estimates() {
        let mut settings = AcquisitionSettings::region_2d("demo");
        settings.time_enabled = true;
        settings.num_time_points = 4;
        let positions = vec![pos()];
        let summary = settings.summary(64, 64, 1, false, 0.5, "0.5_0_0_0.5", &positions);
        assert_eq!(summary.num_frames, 4);
        assert_eq!(summary.num_slices, 1);
        assert_eq!(summary.initial_positions.len(), 1);
        assert_eq!(summary.prefix, "demo");
    }
}
