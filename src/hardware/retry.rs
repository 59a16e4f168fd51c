//! Bounded retry for hardware commands.
//!
//! Long unattended runs must survive transient device faults, so a failed
//! command is retried a fixed number of times with a fixed delay and then
//! abandoned with a warning. Abandonment deliberately does not abort the
//! acquisition: continuing with degraded state loses one tile, aborting
//! loses the night.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::HardwareError;

/// Default number of attempts per command.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 6;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Retry policy applied to every hardware command.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    attempts: u32,
    delay: Duration,
}

impl Default for Retrier {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl Retrier {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run a command, retrying on failure.
    ///
    /// Returns `Some` with the command's result on success, or `None` once
    /// the attempt budget is exhausted. Exhaustion is logged, never raised;
    /// callers continue best-effort.
    pub fn run_best_effort<T>(
        &self,
        what: &str,
        mut command: impl FnMut() -> Result<T, HardwareError>,
    ) -> Option<T> {
        for attempt in 0..self.attempts {
            match command() {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        "problem {what}: {e}; retry #{attempt} in {:?}",
                        self.delay
                    );
                    thread::sleep(self.delay);
                }
            }
        }
        warn!("{what} unsuccessful after {} attempts, giving up", self.attempts);
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
