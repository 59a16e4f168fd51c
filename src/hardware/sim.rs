//! Simulated hardware.
//!
//! Stands in for a real rig in the demo binary and in tests. Devices are
//! plain state behind a mutex; frames are synthetic gradients keyed by the
//! current stage and focus state so that written data sets are visually
//! coherent. Fault injection lets tests exercise the retry wrapper, and the
//! recorded operation log lets them assert command ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::HardwareError;

use super::{CapturedFrame, Hardware};

// =============================================================================
// Operation log
// =============================================================================

/// One hardware command, recorded in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareOp {
    Focus { device: String, z_um: f64 },
    Stage { device: String, x_um: f64, y_um: f64 },
    Exposure { exposure_ms: f64 },
    Property { device: String, property: String, value: String },
    Snap,
}

// =============================================================================
// SimulatedHardware
// =============================================================================

#[derive(Debug, Default)]
struct SimState {
    focus: HashMap<String, f64>,
    stages: HashMap<String, (f64, f64)>,
    properties: HashMap<(String, String), String>,
    exposure_ms: f64,
    ops: Vec<HardwareOp>,
}

/// In-memory hardware implementation.
#[derive(Debug)]
pub struct SimulatedHardware {
    state: Mutex<SimState>,
    width: u32,
    height: u32,
    byte_depth: u8,

    /// Commands left to fail before behaving again (fault injection)
    fail_budget: AtomicU32,
}

impl SimulatedHardware {
    /// Hardware producing frames of the given geometry.
    pub fn new(width: u32, height: u32, byte_depth: u8) -> Self {
        Self {
            state: Mutex::new(SimState {
                exposure_ms: 10.0,
                ..SimState::default()
            }),
            width,
            height,
            byte_depth,
            fail_budget: AtomicU32::new(0),
        }
    }

    /// Make the next `n` commands fail with a transient error.
    pub fn inject_failures(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Drain the recorded operation log.
    pub fn take_ops(&self) -> Vec<HardwareOp> {
        std::mem::take(&mut self.state.lock().unwrap().ops)
    }

    fn maybe_fail(&self, device: &str) -> Result<(), HardwareError> {
        let mut budget = self.fail_budget.load(Ordering::SeqCst);
        while budget > 0 {
            match self.fail_budget.compare_exchange(
                budget,
                budget - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(HardwareError::Command {
                        device: device.to_string(),
                        message: "injected transient fault".to_string(),
                    })
                }
                Err(current) => budget = current,
            }
        }
        Ok(())
    }
}

impl Hardware for SimulatedHardware {
    fn set_focus_position(&self, device: &str, z_um: f64) -> Result<(), HardwareError> {
        self.maybe_fail(device)?;
        let mut state = self.state.lock().unwrap();
        state.focus.insert(device.to_string(), z_um);
        state.ops.push(HardwareOp::Focus {
            device: device.to_string(),
            z_um,
        });
        Ok(())
    }

    fn focus_position(&self, device: &str) -> Result<f64, HardwareError> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .focus
            .get(device)
            .unwrap_or(&0.0))
    }

    fn set_stage_position(
        &self,
        device: &str,
        x_um: f64,
        y_um: f64,
    ) -> Result<(), HardwareError> {
        self.maybe_fail(device)?;
        let mut state = self.state.lock().unwrap();
        state.stages.insert(device.to_string(), (x_um, y_um));
        state.ops.push(HardwareOp::Stage {
            device: device.to_string(),
            x_um,
            y_um,
        });
        Ok(())
    }

    fn stage_position(&self, device: &str) -> Result<(f64, f64), HardwareError> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .stages
            .get(device)
            .unwrap_or(&(0.0, 0.0)))
    }

    fn set_exposure(&self, exposure_ms: f64) -> Result<(), HardwareError> {
        self.maybe_fail("Camera")?;
        let mut state = self.state.lock().unwrap();
        state.exposure_ms = exposure_ms;
        state.ops.push(HardwareOp::Exposure { exposure_ms });
        Ok(())
    }

    fn exposure(&self) -> Result<f64, HardwareError> {
        Ok(self.state.lock().unwrap().exposure_ms)
    }

    fn set_property(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> Result<(), HardwareError> {
        self.maybe_fail(device)?;
        let mut state = self.state.lock().unwrap();
        state
            .properties
            .insert((device.to_string(), property.to_string()), value.to_string());
        state.ops.push(HardwareOp::Property {
            device: device.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn property(&self, device: &str, property: &str) -> Result<String, HardwareError> {
        self.state
            .lock()
            .unwrap()
            .properties
            .get(&(device.to_string(), property.to_string()))
            .cloned()
            .ok_or_else(|| HardwareError::UnknownProperty {
                device: device.to_string(),
                property: property.to_string(),
            })
    }

    fn is_busy(&self, _device: &str) -> Result<bool, HardwareError> {
        // Simulated moves complete instantly
        Ok(false)
    }

    fn snap_image(&self) -> Result<CapturedFrame, HardwareError> {
        self.maybe_fail("Camera")?;
        let mut state = self.state.lock().unwrap();
        state.ops.push(HardwareOp::Snap);

        // Gradient seeded by stage/focus state so tiles differ across the grid
        let (sx, sy) = state.stages.values().next().copied().unwrap_or((0.0, 0.0));
        let z = state.focus.values().next().copied().unwrap_or(0.0);
        let seed = (sx + 3.0 * sy + 7.0 * z) as i64;

        let samples = (self.width * self.height) as usize;
        let mut pix = Vec::with_capacity(samples * self.byte_depth as usize);
        for i in 0..samples {
            let x = i as u32 % self.width;
            let y = i as u32 / self.width;
            let value = (x as i64 + y as i64 + seed).rem_euclid(256) as u16;
            if self.byte_depth == 1 {
                pix.push(value as u8);
            } else {
                pix.extend_from_slice(&(value * 128).to_le_bytes());
            }
        }

        Ok(CapturedFrame {
            pix: Bytes::from(pix),
            width: self.width,
            height: self.height,
            byte_depth: self.byte_depth,
            rgb: false,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
