//! Audio output backends.
//!
//! The playback engine drives a backend through this narrow interface and
//! never touches decoding or device handling itself.

mod rodio_backend;
mod simulated;

use std::path::Path;

use crate::error::Result;

pub use rodio_backend::RodioBackend;
pub use simulated::{BackendCall, SimulatedBackend};

pub trait AudioBackend: Send + Sync {
    /// Opens and decodes `path`, replacing anything previously loaded. The
    /// track stays paused until `play`.
    fn load(&self, path: &Path) -> Result<()>;

    fn play(&self) -> Result<()>;

    fn stop(&self);

    /// True while the loaded track still has samples to output.
    fn is_busy(&self) -> bool;

    /// Percent, clamped to 0-100.
    fn set_volume(&self, percent: u8);

    /// Names accepted by [`select_output`](Self::select_output).
    fn output_devices(&self) -> Result<Vec<String>>;

    /// Reopens output on the named device, or the system default for
    /// `None`. Anything loaded is dropped. When the device is unavailable
    /// this fails and the previous output stays in use.
    fn select_output(&self, name: Option<&str>) -> Result<()>;
}

pub(crate) fn volume_to_gain(percent: u8) -> f32 {
    f32::from(percent.min(100)) / 100.0
}
