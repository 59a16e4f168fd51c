//! Acquisition events.
//!
//! One event describes one unit of engine work: a capture at a given
//! time/channel/slice/position, or a control marker flowing through the
//! same queues. Events are immutable once constructed; the generator
//! creates them, the engine consumes each exactly once, and nothing holds
//! them afterwards.

use std::sync::Arc;

use crate::coords::XyPosition;

use super::settings::CovariantPairing;

/// Control markers. A special event carries no capture semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// Plain capture event
    None,

    /// All events of one timepoint have been generated
    TimepointFinished,

    /// All events of the acquisition have been generated; exactly one per
    /// acquisition lifetime, also on abort
    AcquisitionFinished,

    /// The engine's current task (group or explore) is complete
    EngineTaskFinished,

    /// Wake a consumer blocked on a queue whose acquisition went inactive
    Requeue,

    /// Move an autofocus drive, no capture
    AutofocusAdjustment,
}

/// Target of an autofocus adjustment event.
#[derive(Debug, Clone)]
pub struct AutofocusMove {
    pub z_device: String,
    pub z_um: f64,
}

/// One unit of engine work.
#[derive(Debug, Clone)]
pub struct AcquisitionEvent {
    /// Index of the owning acquisition within its group
    pub acq_index: usize,

    pub time_index: usize,
    pub channel_index: usize,
    pub slice_index: i64,
    pub position_index: usize,

    /// Absolute focus position for this slice, micrometers
    pub z_um: f64,

    /// Stage position of the tile; `None` for special events
    pub xy: Option<XyPosition>,

    pub special: Special,

    /// Present only for autofocus-adjustment events
    pub autofocus: Option<AutofocusMove>,

    /// Device-property pairings applied at hardware-update time
    pub covariants: Arc<[CovariantPairing]>,
}

impl AcquisitionEvent {
    /// A capture event.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        acq_index: usize,
        time_index: usize,
        channel_index: usize,
        slice_index: i64,
        position_index: usize,
        z_um: f64,
        xy: XyPosition,
        covariants: Arc<[CovariantPairing]>,
    ) -> Self {
        Self {
            acq_index,
            time_index,
            channel_index,
            slice_index,
            position_index,
            z_um,
            xy: Some(xy),
            special: Special::None,
            autofocus: None,
            covariants,
        }
    }

    pub fn timepoint_finished(acq_index: usize) -> Self {
        Self::special(acq_index, Special::TimepointFinished)
    }

    pub fn acquisition_finished(acq_index: usize) -> Self {
        Self::special(acq_index, Special::AcquisitionFinished)
    }

    pub fn engine_task_finished() -> Self {
        Self::special(0, Special::EngineTaskFinished)
    }

    pub fn requeue(acq_index: usize) -> Self {
        Self::special(acq_index, Special::Requeue)
    }

    pub fn autofocus_adjustment(acq_index: usize, z_device: &str, z_um: f64) -> Self {
        let mut event = Self::special(acq_index, Special::AutofocusAdjustment);
        event.autofocus = Some(AutofocusMove {
            z_device: z_device.to_string(),
            z_um,
        });
        event
    }

    fn special(acq_index: usize, special: Special) -> Self {
        Self {
            acq_index,
            time_index: 0,
            channel_index: 0,
            slice_index: 0,
            position_index: 0,
            z_um: 0.0,
            xy: None,
            special,
            autofocus: None,
            covariants: Arc::from([]),
        }
    }

    pub fn is_capture(&self) -> bool {
        self.special == Special::None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_event_fields() {
        let xy = XyPosition::new(1, 2, 10.0, 20.0);
        let event =
            AcquisitionEvent::capture(0, 3, 1, 4, 7, 12.5, xy, Arc::from([]));
        assert!(event.is_capture());
        assert_eq!(event.time_index, 3);
        assert_eq!(event.slice_index, 4);
        assert_eq!(event.xy.unwrap().grid_row, 1);
        assert!(event.autofocus.is_none());
    }

    #[test]
    fn test_special_events_carry_no_capture_semantics() {
        let event = AcquisitionEvent::timepoint_finished(2);
        assert!(!event.is_capture());
        assert_eq!(event.special, Special::TimepointFinished);
        assert_eq!(event.acq_index, 2);
        assert!(event.xy.is_none());

        let af = AcquisitionEvent::autofocus_adjustment(0, "AutofocusZ", 5.5);
        assert_eq!(af.special, Special::AutofocusAdjustment);
        let target = af.autofocus.unwrap();
        assert_eq!(target.z_device, "AutofocusZ");
        assert_eq!(target.z_um, 5.5);
    }
}
