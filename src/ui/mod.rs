//! Status display.
//!
//! The observer only ever reads the engine's state; it never drives
//! playback. Input comes back to the application as [`UiIntent`]s.

mod menu;

use std::io::{self, Write};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::PlaybackState;
use crate::playback::PlaybackEngine;

pub use menu::{FileMenu, UiIntent};

/// Highest refresh rate the observer will run at.
pub const MAX_REFRESH_HZ: u32 = 30;

pub trait StatusView: Send {
    fn render(&mut self, state: &PlaybackState);
}

/// Prints a line whenever the playback state changes.
#[derive(Default)]
pub struct ConsoleView {
    last: Option<PlaybackState>,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusView for ConsoleView {
    fn render(&mut self, state: &PlaybackState) {
        if self.last.as_ref() == Some(state) {
            return;
        }
        info!("State: {}", state.describe());
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "[{}]", state.describe());
        let _ = out.flush();
        self.last = Some(state.clone());
    }
}

/// Runtime task that samples the engine state and hands it to a view.
pub struct UiObserver {
    cancel_token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl UiObserver {
    /// Spawns the render loop on the current runtime.
    pub fn spawn(engine: PlaybackEngine, mut view: Box<dyn StatusView>, refresh_hz: u32) -> Self {
        let hz = refresh_hz.clamp(1, MAX_REFRESH_HZ);
        if hz != refresh_hz {
            warn!("UI refresh rate {refresh_hz} Hz out of range; using {hz} Hz");
        }
        let period = Duration::from_millis(1000 / u64::from(hz));
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => view.render(&engine.current_state()),
                    _ = token_clone.cancelled() => break,
                }
            }
        });

        Self {
            cancel_token: Some(cancel_token),
            handle: Some(handle),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("UI task failed to join")?;
        }
        Ok(())
    }
}

impl Drop for UiObserver {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedBackend;
    use crate::db::MemoryStore;
    use crate::media::DirectoryLibrary;
    use crate::models::TagId;
    use crate::playback::PlaybackConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    struct RecordingView(Arc<Mutex<Vec<PlaybackState>>>);

    impl StatusView for RecordingView {
        fn render(&mut self, state: &PlaybackState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    fn engine() -> (tempfile::TempDir, PlaybackEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = PlaybackEngine::new(
            Arc::new(SimulatedBackend::new(Duration::from_secs(60))),
            Arc::new(MemoryStore::new()),
            Arc::new(DirectoryLibrary::new(dir.path())),
            PlaybackConfig::default(),
        );
        (dir, engine)
    }

    #[tokio::test]
    async fn observer_sees_state_changes_and_stops() {
        let (_dir, engine) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observer = UiObserver::spawn(
            engine.clone(),
            Box::new(RecordingView(seen.clone())),
            30,
        );

        engine.play(&TagId::parse("0404").unwrap());
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && !seen
                .lock()
                .unwrap()
                .contains(&PlaybackState::Error("unknown id: 0404".into()))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = Instant::now();
        observer.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&PlaybackState::Idle));
        assert!(seen.contains(&PlaybackState::Error("unknown id: 0404".into())));
    }

    #[tokio::test]
    async fn refresh_rate_is_capped() {
        let (_dir, engine) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observer =
            UiObserver::spawn(engine, Box::new(RecordingView(seen.clone())), 1_000);
        tokio::time::sleep(Duration::from_millis(300)).await;
        observer.stop().await.unwrap();

        // 30 Hz over 300 ms is about ten frames.
        assert!(seen.lock().unwrap().len() <= 15);
    }
}
