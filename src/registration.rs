use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::db::MappingStore;
use crate::error::{Error, Result};
use crate::media::MediaLibrary;
use crate::models::TagId;
use crate::playback::PlaybackEngine;
use crate::reader::TagSource;
use crate::session::{SessionGate, SuspendGuard};

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// How long to wait for a tag before giving up.
    pub read_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured {
        tag: TagId,
        /// File the tag is already mapped to, if any.
        existing: Option<String>,
    },
    TimedOut,
    Cancelled,
}

/// Cancels whichever capture is running when `cancel` is called.
///
/// Every capture gets a fresh [`CancellationToken`], so a cancel that lands
/// between captures does not abort the next one.
#[derive(Clone, Default)]
pub struct CaptureCancel {
    current: Arc<Mutex<CancellationToken>>,
}

impl CaptureCancel {
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock() = token.clone();
        token
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Binds new tags to files on the media directory.
pub struct Registrar {
    source: Arc<TagSource>,
    engine: PlaybackEngine,
    mappings: Arc<dyn MappingStore>,
    media: Arc<dyn MediaLibrary>,
    gate: SessionGate,
    cancel: CaptureCancel,
    config: RegistrationConfig,
}

impl Registrar {
    pub fn new(
        source: Arc<TagSource>,
        engine: PlaybackEngine,
        mappings: Arc<dyn MappingStore>,
        media: Arc<dyn MediaLibrary>,
        gate: SessionGate,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            source,
            engine,
            mappings,
            media,
            gate,
            cancel: CaptureCancel::default(),
            config,
        }
    }

    /// Handle that aborts a running [`capture_tag`](Self::capture_tag).
    pub fn cancel_handle(&self) -> CaptureCancel {
        self.cancel.clone()
    }

    /// Keeps the session loop away from the reader until the guard drops.
    /// Hold it across capture, file choice and commit so the captured tag
    /// does not start its old track meanwhile.
    pub fn hold(&self) -> SuspendGuard {
        self.gate.suspend()
    }

    /// Stops playback and waits for a tag on the reader.
    ///
    /// Must run on a tokio runtime; the gate, engine and store calls go
    /// through the blocking pool.
    pub async fn capture_tag(&self) -> CaptureOutcome {
        let cancel_token = self.cancel.arm();

        // Suspend first: a tick already in flight may still start a track.
        let gate = self.gate.clone();
        let engine = self.engine.clone();
        let suspended = tokio::task::spawn_blocking(move || {
            let guard = gate.suspend();
            engine.stop();
            guard
        })
        .await;
        let _suspended = match suspended {
            Ok(guard) => guard,
            Err(err) => {
                warn!("Could not pause the session loop for registration: {err}");
                return CaptureOutcome::Cancelled;
            }
        };

        info!(
            "Waiting up to {:?} for a tag to register",
            self.config.read_timeout
        );
        let read = Arc::clone(&self.source)
            .read_with_timeout(
                self.config.read_timeout,
                self.config.poll_interval,
                &cancel_token,
            )
            .await;

        match read {
            Some(tag) => {
                let mappings = Arc::clone(&self.mappings);
                let lookup = tag.clone();
                let existing =
                    match tokio::task::spawn_blocking(move || mappings.get(&lookup)).await {
                        Ok(Ok(existing)) => existing,
                        Ok(Err(err)) => {
                            warn!("Could not look up existing mapping for {tag}: {err:#}");
                            None
                        }
                        Err(err) => {
                            warn!("Mapping lookup worker for {tag} failed: {err}");
                            None
                        }
                    };
                info!("Captured tag {tag} for registration");
                CaptureOutcome::Captured { tag, existing }
            }
            None if cancel_token.is_cancelled() => {
                info!("Registration cancelled");
                CaptureOutcome::Cancelled
            }
            None => {
                info!("No tag presented; registration timed out");
                CaptureOutcome::TimedOut
            }
        }
    }

    /// Files a tag can be bound to.
    pub fn available_files(&self) -> anyhow::Result<Vec<String>> {
        let files = self.media.list_files()?;
        if files.is_empty() {
            bail!("no audio files found in media directory");
        }
        Ok(files)
    }

    /// Binds `tag` to `file`, replacing any earlier binding.
    pub fn commit(&self, tag: &TagId, file: &str) -> Result<()> {
        if !self.media.contains(file) {
            return Err(Error::MediaMissing(file.to_string()));
        }

        match self.mappings.upsert(tag, file)? {
            Some(previous) if previous != file => {
                info!("Updated mapping {tag}: {previous} -> {file}")
            }
            Some(_) => info!("Mapping {tag} -> {file} unchanged"),
            None => info!("Registered new mapping {tag} -> {file}"),
        }
        Ok(())
    }
}
