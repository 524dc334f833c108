use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::AudioBackend;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Load(PathBuf),
    Play,
    Stop,
    SetVolume(u8),
    SelectOutput(Option<String>),
}

/// Outputs offered unless `with_outputs` says otherwise.
const SIMULATED_OUTPUTS: [&str; 2] = ["speaker", "aux"];

#[derive(Default)]
struct SimState {
    loaded: Option<PathBuf>,
    // Bumped by every load and stop; a load only lands if no newer call
    // came in while it was decoding.
    load_seq: u64,
    load_delay: Duration,
    started_at: Option<Instant>,
    calls: Vec<BackendCall>,
    volume: u8,
    output: Option<String>,
}

/// Backend that "plays" every track for a fixed length without touching a
/// sound device. Used by `--simulate` and by the tests, which inspect the
/// call log.
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    track_length: Duration,
    fail_loads: bool,
    outputs: Vec<String>,
}

impl SimulatedBackend {
    pub fn new(track_length: Duration) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            track_length,
            fail_loads: false,
            outputs: SIMULATED_OUTPUTS.iter().map(|name| name.to_string()).collect(),
        }
    }

    /// Makes every `load` sleep first, like a slow USB stick.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        self.set_load_delay(delay);
        self
    }

    /// Changes the delay for loads started from now on.
    pub fn set_load_delay(&self, delay: Duration) {
        self.lock().load_delay = delay;
    }

    /// Makes every `load` fail with a decode error.
    pub fn failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Replaces the list of outputs that can be selected.
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Output picked by the last successful `select_output`.
    pub fn output(&self) -> Option<String> {
        self.lock().output.clone()
    }

    /// Track that would be heard on `play`.
    pub fn loaded(&self) -> Option<PathBuf> {
        self.lock().loaded.clone()
    }

    pub fn volume(&self) -> u8 {
        self.lock().volume
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn load(&self, path: &Path) -> Result<()> {
        let (ticket, delay) = {
            let mut state = self.lock();
            state.calls.push(BackendCall::Load(path.to_path_buf()));
            state.load_seq += 1;
            (state.load_seq, state.load_delay)
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.fail_loads {
            return Err(Error::PlaybackBackend(format!(
                "failed to decode {}: unsupported format",
                path.display()
            )));
        }

        let mut state = self.lock();
        if state.load_seq != ticket {
            log::debug!("Dropping superseded load of {}", path.display());
            return Ok(());
        }
        state.loaded = Some(path.to_path_buf());
        state.started_at = None;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Play);
        if state.loaded.is_none() {
            return Err(Error::PlaybackBackend("no track loaded".into()));
        }
        state.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.calls.push(BackendCall::Stop);
        state.load_seq += 1;
        state.loaded = None;
        state.started_at = None;
    }

    fn is_busy(&self) -> bool {
        let state = self.lock();
        match (&state.loaded, state.started_at) {
            (Some(_), Some(started)) => started.elapsed() < self.track_length,
            _ => false,
        }
    }

    fn set_volume(&self, percent: u8) {
        let mut state = self.lock();
        let percent = percent.min(100);
        state.volume = percent;
        state.calls.push(BackendCall::SetVolume(percent));
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        Ok(self.outputs.clone())
    }

    fn select_output(&self, name: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BackendCall::SelectOutput(name.map(str::to_string)));
        if let Some(name) = name {
            if !self.outputs.iter().any(|output| output == name) {
                return Err(Error::PlaybackBackend(format!("{name} device unavailable")));
            }
        }
        state.load_seq += 1;
        state.loaded = None;
        state.started_at = None;
        state.output = name.map(str::to_string);
        Ok(())
    }
}
