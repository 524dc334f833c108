use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::{
    playback::PlaybackConfig, reader::ReaderConfig, registration::RegistrationConfig,
    session::SessionConfig,
};

pub const ENV_MEDIA_PATH: &str = "TAGPLAYER_MEDIA_PATH";
pub const ENV_DATABASE: &str = "TAGPLAYER_DATABASE";
pub const ENV_DEVICE: &str = "TAGPLAYER_DEVICE";
pub const ENV_VOLUME: &str = "TAGPLAYER_VOLUME";
pub const ENV_OUTPUT_DEVICE: &str = "TAGPLAYER_OUTPUT_DEVICE";

/// Polling, debounce and recovery intervals. Every sleep in the controller
/// comes from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timings {
    pub tick_interval_ms: u64,
    pub debounce_delay_ms: u64,
    pub departure_threshold: u32,
    pub error_backoff_ms: u64,
    pub max_consecutive_errors: u32,
    pub reinit_interval_secs: u64,
    pub reset_delay_ms: u64,
    /// How long a line-device tag stays present after its last report.
    pub presence_window_ms: u64,
    pub playback_join_timeout_ms: u64,
    pub playback_poll_interval_ms: u64,
    pub registration_timeout_secs: u64,
    pub registration_poll_interval_ms: u64,
    pub ui_refresh_hz: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            debounce_delay_ms: 2_000,
            departure_threshold: 2,
            error_backoff_ms: 1_000,
            max_consecutive_errors: 5,
            reinit_interval_secs: 120,
            reset_delay_ms: 500,
            presence_window_ms: 500,
            playback_join_timeout_ms: 1_000,
            playback_poll_interval_ms: 100,
            registration_timeout_secs: 30,
            registration_poll_interval_ms: 100,
            ui_refresh_hz: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub media_path: PathBuf,
    pub database_path: PathBuf,
    pub reader_device: PathBuf,
    /// Percent, 0-100.
    pub volume: u8,
    /// Name of the sound output to open. `None` uses the system default.
    pub output_device: Option<String>,
    pub timings: Timings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            media_path: PathBuf::from("/media/pi"),
            database_path: PathBuf::from("tagplayer.sqlite3"),
            reader_device: PathBuf::from("/dev/ttyUSB0"),
            volume: 25,
            output_device: None,
            timings: Timings::default(),
        }
    }
}

impl Settings {
    /// Applies `TAGPLAYER_*` overrides. Unparseable values are ignored with a
    /// warning so a typo in the unit file does not stop the player.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_MEDIA_PATH) {
            self.media_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_DEVICE) {
            self.reader_device = PathBuf::from(path);
        }
        if let Some(name) = lookup(ENV_OUTPUT_DEVICE) {
            let name = name.trim();
            self.output_device = (!name.is_empty()).then(|| name.to_string());
        }
        if let Some(raw) = lookup(ENV_VOLUME) {
            match raw.trim().parse::<u8>() {
                Ok(volume) => self.volume = volume.min(100),
                Err(err) => warn!("Ignoring {ENV_VOLUME}={raw:?}: {err}"),
            }
        }
    }

    pub fn reader(&self) -> ReaderConfig {
        let t = &self.timings;
        ReaderConfig {
            max_consecutive_errors: t.max_consecutive_errors.max(1),
            reinit_interval: Duration::from_secs(t.reinit_interval_secs),
            reset_delay: Duration::from_millis(t.reset_delay_ms),
        }
    }

    pub fn playback(&self) -> PlaybackConfig {
        let t = &self.timings;
        PlaybackConfig {
            join_timeout: Duration::from_millis(t.playback_join_timeout_ms),
            poll_interval: Duration::from_millis(t.playback_poll_interval_ms.max(1)),
            initial_volume: self.volume.min(100),
        }
    }

    pub fn session(&self) -> SessionConfig {
        let t = &self.timings;
        SessionConfig {
            tick_interval: Duration::from_millis(t.tick_interval_ms),
            debounce_delay: Duration::from_millis(t.debounce_delay_ms),
            departure_threshold: t.departure_threshold.max(1),
            error_backoff: Duration::from_millis(t.error_backoff_ms),
        }
    }

    pub fn registration(&self) -> RegistrationConfig {
        let t = &self.timings;
        RegistrationConfig {
            read_timeout: Duration::from_secs(t.registration_timeout_secs),
            poll_interval: Duration::from_millis(t.registration_poll_interval_ms.max(1)),
        }
    }

    pub fn presence_window(&self) -> Duration {
        Duration::from_millis(self.timings.presence_window_ms)
    }

    pub fn ui_refresh_hz(&self) -> u32 {
        self.timings.ui_refresh_hz
    }
}

/// Settings loaded from a JSON file, with volume and output changes
/// written back.
///
/// Overrides from the environment and command line only touch the
/// effective view. Writes go to a separate copy of what the file holds, so a
/// one-off `--media-dir` never ends up on disk.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Layers>,
}

struct Layers {
    saved: Settings,
    effective: Settings,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let saved: Settings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Settings file {} is invalid ({err}); using defaults",
                    path.display()
                );
                Settings::default()
            })
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(Layers {
                effective: saved.clone(),
                saved,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Settings {
        self.read().effective.clone()
    }

    /// Mutates the in-memory settings without persisting them. Used for
    /// environment and command-line overrides.
    pub fn override_with<F>(&self, apply: F)
    where
        F: FnOnce(&mut Settings),
    {
        apply(&mut self.write().effective);
    }

    pub fn update_volume(&self, volume: u8) -> Result<()> {
        let volume = volume.min(100);
        self.update(|settings| settings.volume = volume)
    }

    pub fn update_output_device(&self, name: Option<&str>) -> Result<()> {
        self.update(|settings| settings.output_device = name.map(str::to_string))
    }

    /// Applies `change` to both layers and writes the saved one back.
    fn update<F>(&self, change: F) -> Result<()>
    where
        F: Fn(&mut Settings),
    {
        let mut guard = self.write();
        change(&mut guard.effective);
        change(&mut guard.saved);
        self.persist(&guard.saved)
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, Layers> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Layers> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
