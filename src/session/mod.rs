mod controller;
mod debounce;
mod gate;
mod loop_worker;

use std::time::Duration;

pub use controller::SessionController;
pub use debounce::{step, DebounceTracker, TagEvent, TrackerState};
pub use gate::{SessionGate, SuspendGuard};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between reads while nothing changes.
    pub tick_interval: Duration,
    /// Pause after an arrival before the reader is polled again.
    pub debounce_delay: Duration,
    /// Empty polls in a row that count as the tag being removed.
    pub departure_threshold: u32,
    /// Pause after a tick fails unexpectedly.
    pub error_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            debounce_delay: Duration::from_secs(2),
            departure_threshold: 2,
            error_backoff: Duration::from_secs(1),
        }
    }
}
