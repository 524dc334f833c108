use std::time::{Duration, Instant};

use serde::Serialize;

/// Reader fault bookkeeping, owned by [`super::TagSource`].
#[derive(Debug, Clone)]
pub struct ReaderHealth {
    consecutive_errors: u32,
    last_success: Option<Instant>,
    // Start of the current no-success window: the later of the last
    // successful read and the last reset.
    window_start: Instant,
    resets: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub consecutive_errors: u32,
    pub resets: u64,
    pub ms_since_success: Option<u64>,
}

impl ReaderHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_errors: 0,
            last_success: None,
            window_start: now,
            resets: 0,
        }
    }

    /// A tag was read.
    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_errors = 0;
        self.last_success = Some(now);
        self.window_start = now;
    }

    /// The device answered but no tag was in range. Breaks an error streak
    /// without counting as a successful read.
    pub fn record_empty(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Returns the new length of the error streak.
    pub fn record_error(&mut self) -> u32 {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_errors
    }

    pub fn record_reset(&mut self, now: Instant) {
        self.consecutive_errors = 0;
        self.window_start = now;
        self.resets = self.resets.saturating_add(1);
    }

    pub fn reinit_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= interval
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_errors: self.consecutive_errors,
            resets: self.resets,
            ms_since_success: self
                .last_success
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }
}
