//! RFID reader access.
//!
//! [`ReaderDevice`] is the raw driver. [`TagSource`] wraps one device behind a
//! lock and owns fault recovery; everything else in the crate talks to the
//! `TagSource`.

mod health;
mod line_device;
mod simulated;
mod source;

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::models::TagId;

pub use health::{HealthSnapshot, ReaderHealth};
pub use line_device::LineDeviceReader;
pub use simulated::{DeviceEvent, SimulatedReader, SimulatedReaderHandle};
pub use source::TagSource;

pub trait ReaderDevice: Send {
    /// Tag currently in range, if any. Must return after a single I/O call.
    fn poll_non_blocking(&mut self) -> Result<Option<TagId>>;

    /// Waits until a tag is read.
    fn blocking_read(&mut self) -> Result<TagId>;

    /// Releases the underlying device handle.
    fn teardown(&mut self);

    /// Reopens the device after `teardown`.
    fn reinit(&mut self) -> Result<()>;

    /// Full driver reset: teardown, let the hardware settle, reinit.
    fn reset(&mut self, settle: Duration) -> Result<()> {
        self.teardown();
        thread::sleep(settle);
        self.reinit()
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Errors in a row that force a reset.
    pub max_consecutive_errors: u32,
    /// Longest time without a successful read before a proactive reset.
    pub reinit_interval: Duration,
    /// Pause between teardown and reinit.
    pub reset_delay: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            reinit_interval: Duration::from_secs(120),
            reset_delay: Duration::from_millis(500),
        }
    }
}
