mod engine;
mod state;
mod task;

use std::time::Duration;

pub use engine::PlaybackEngine;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Longest wait for a cancelled playback thread to exit.
    pub join_timeout: Duration,
    /// How often a playing task checks for cancellation and end of track.
    pub poll_interval: Duration,
    /// Percent, applied when the engine starts.
    pub initial_volume: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            initial_volume: 25,
        }
    }
}
