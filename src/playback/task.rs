use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::state::SharedState;
use crate::audio::AudioBackend;
use crate::error::{Error, Result};
use crate::models::PlaybackState;

// Set to false to silence playback task logging
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

/// Handle to the thread playing one track.
pub(crate) struct PlaybackTask {
    track: String,
    cancel_token: CancellationToken,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Signals completion and releases the live-task count even if the task
/// unwinds.
struct ExitGuard {
    done: Sender<()>,
    shared: Arc<SharedState>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.task_finished();
        let _ = self.done.send(());
    }
}

pub(crate) struct TaskSpec {
    pub track: String,
    pub path: PathBuf,
    pub generation: u64,
    pub poll_interval: Duration,
}

impl PlaybackTask {
    pub(crate) fn spawn(
        spec: TaskSpec,
        backend: Arc<dyn AudioBackend>,
        shared: Arc<SharedState>,
    ) -> Result<Self> {
        let cancel_token = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel();
        let track = spec.track.clone();

        shared.task_started();
        let guard = ExitGuard {
            done: done_tx,
            shared: Arc::clone(&shared),
        };
        let task_token = cancel_token.clone();

        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let _guard = guard;
                let generation = spec.generation;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    play_to_end(&spec, backend.as_ref(), &task_token)
                }));

                let next = match outcome {
                    Ok(Ok(())) => PlaybackState::Idle,
                    Ok(Err(err)) => {
                        log_error!("Audio playback error for {}: {err}", spec.track);
                        PlaybackState::Error(err.to_string())
                    }
                    Err(_) => {
                        log_error!("Playback task for {} panicked", spec.track);
                        PlaybackState::Error(format!("playback of {} crashed", spec.track))
                    }
                };

                if !shared.settle(generation, next) {
                    log_debug!("Playback of {} superseded; state left alone", spec.track);
                }
                log_debug!("Playback finished or stopped: {}", spec.track);
            })
            .map_err(|err| {
                Error::PlaybackBackend(format!("failed to start playback thread: {err}"))
            })?;

        Ok(Self {
            track,
            cancel_token,
            done: done_rx,
            handle: Some(handle),
        })
    }

    pub(crate) fn track(&self) -> &str {
        &self.track
    }

    /// Cancels the task and waits up to `timeout` for the thread to exit.
    /// Returns false if it had to be left running.
    pub(crate) fn cancel_and_join(mut self, timeout: Duration) -> bool {
        self.cancel_token.cancel();
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        log_warn!("Playback thread for {} panicked", self.track);
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log_warn!(
                    "Playback of {} did not stop within {:?}; continuing without it",
                    self.track,
                    timeout
                );
                false
            }
        }
    }
}

fn play_to_end(
    spec: &TaskSpec,
    backend: &dyn AudioBackend,
    cancel_token: &CancellationToken,
) -> Result<()> {
    if cancel_token.is_cancelled() {
        return Ok(());
    }
    backend.load(&spec.path)?;

    // A slow load may have outlived the request.
    if cancel_token.is_cancelled() {
        return Ok(());
    }
    backend.play()?;
    log_debug!("Started playback of: {}", spec.track);

    loop {
        // The thread is not on a runtime, so the token is polled.
        thread::sleep(spec.poll_interval);
        if cancel_token.is_cancelled() {
            return Ok(());
        }
        if !backend.is_busy() {
            return Ok(());
        }
    }
}
