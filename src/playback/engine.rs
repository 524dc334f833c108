use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{info, warn};

use super::state::SharedState;
use super::task::{PlaybackTask, TaskSpec};
use super::PlaybackConfig;
use crate::audio::AudioBackend;
use crate::db::MappingStore;
use crate::error::{Error, Result};
use crate::media::MediaLibrary;
use crate::models::{PlaybackState, TagId};

struct EngineInner {
    shared: Arc<SharedState>,
    // Operation lock: serializes play/stop so that cancelling the old task
    // and starting the new one happen as one step. Playback tasks never take
    // it, so holding it across the bounded join cannot deadlock.
    active: Mutex<Option<PlaybackTask>>,
    backend: Arc<dyn AudioBackend>,
    mappings: Arc<dyn MappingStore>,
    media: Arc<dyn MediaLibrary>,
    volume: AtomicU8,
    output: RwLock<Option<String>>,
    config: PlaybackConfig,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let task = match self.active.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.cancel_and_join(self.config.join_timeout);
            self.backend.stop();
        }
    }
}

/// Owns the single playback operation and the state the display reads.
///
/// Cheap to clone; clones share the same engine. Nothing here returns an
/// error: failures land in [`PlaybackState::Error`] and the log.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}

impl PlaybackEngine {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        mappings: Arc<dyn MappingStore>,
        media: Arc<dyn MediaLibrary>,
        config: PlaybackConfig,
    ) -> Self {
        let volume = config.initial_volume.min(100);
        backend.set_volume(volume);
        info!("Volume initialized to {volume}%");

        Self {
            inner: Arc::new(EngineInner {
                shared: Arc::new(SharedState::new()),
                active: Mutex::new(None),
                backend,
                mappings,
                media,
                volume: AtomicU8::new(volume),
                output: RwLock::new(None),
                config,
            }),
        }
    }

    /// Plays the file mapped to `tag`.
    ///
    /// An unmapped tag stops whatever is playing and leaves
    /// `Error("unknown id: …")` without loading any audio.
    pub fn play(&self, tag: &TagId) -> PlaybackState {
        match self.inner.mappings.get(tag) {
            Ok(Some(file)) => {
                info!("Playing audio for RFID ID: {tag}, file: {file}");
                self.play_file(&file)
            }
            Ok(None) => {
                warn!("Unknown RFID ID: {tag}");
                self.fail(Error::UnknownTag(tag.clone()))
            }
            Err(err) => {
                warn!("Mapping lookup for {tag} failed: {err:#}");
                self.fail(Error::Store(err))
            }
        }
    }

    /// Plays `name` from the media directory, replacing any current track.
    pub fn play_file(&self, name: &str) -> PlaybackState {
        let mut active = self.lock_active();
        self.cancel_active(&mut active);

        if !self.inner.media.contains(name) {
            warn!("Audio file not found: {name}");
            self.inner
                .shared
                .replace(PlaybackState::Error(Error::MediaMissing(name.to_string()).to_string()));
            return self.current_state();
        }

        let generation = self
            .inner
            .shared
            .replace(PlaybackState::Playing(name.to_string()));
        let spec = TaskSpec {
            track: name.to_string(),
            path: self.inner.media.resolve(name),
            generation,
            poll_interval: self.inner.config.poll_interval,
        };

        match PlaybackTask::spawn(
            spec,
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.shared),
        ) {
            Ok(task) => {
                info!("Playing file: {name}");
                *active = Some(task);
            }
            Err(err) => {
                warn!("{err}");
                self.inner
                    .shared
                    .settle(generation, PlaybackState::Error(err.to_string()));
            }
        }

        self.current_state()
    }

    /// Stops playback and returns to `Idle`. Safe to call when idle.
    pub fn stop(&self) {
        let mut active = self.lock_active();
        self.cancel_active(&mut active);
        self.inner.shared.replace(PlaybackState::Idle);
    }

    /// Snapshot for the display. Only waits on the state guard, never on
    /// audio I/O.
    pub fn current_state(&self) -> PlaybackState {
        self.inner.shared.snapshot()
    }

    /// Clamps to 0-100 and returns the applied value.
    pub fn set_volume(&self, percent: u8) -> u8 {
        let percent = percent.min(100);
        self.inner.volume.store(percent, Ordering::SeqCst);
        self.inner.backend.set_volume(percent);
        info!("Volume set to {percent}%");
        percent
    }

    pub fn volume(&self) -> u8 {
        self.inner.volume.load(Ordering::SeqCst)
    }

    /// Outputs the backend can switch to.
    pub fn output_devices(&self) -> Result<Vec<String>> {
        self.inner.backend.output_devices()
    }

    /// Selected output, `None` while on the system default.
    pub fn output_device(&self) -> Option<String> {
        match self.inner.output.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stops playback and moves output to `name` (`None` for the system
    /// default), then reapplies the volume. On failure the engine stays idle
    /// on the previous output.
    pub fn set_output_device(&self, name: Option<&str>) -> Result<()> {
        let mut active = self.lock_active();
        self.cancel_active(&mut active);
        self.inner.shared.replace(PlaybackState::Idle);

        let label = name.unwrap_or("default");
        if let Err(err) = self.inner.backend.select_output(name) {
            warn!("Failed to switch audio output to {label}: {err}");
            return Err(err);
        }
        self.inner.backend.set_volume(self.volume());

        let mut output = match self.inner.output.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *output = name.map(str::to_string);
        info!("Audio output switched to {label}");
        Ok(())
    }

    /// Playback threads currently alive, including any left behind by a
    /// join that timed out.
    pub fn live_tasks(&self) -> usize {
        self.inner.shared.live_tasks()
    }

    fn fail(&self, err: Error) -> PlaybackState {
        let mut active = self.lock_active();
        self.cancel_active(&mut active);
        self.inner
            .shared
            .replace(PlaybackState::Error(err.to_string()));
        self.current_state()
    }

    fn cancel_active(&self, active: &mut Option<PlaybackTask>) {
        let Some(task) = active.take() else {
            return;
        };

        // The old task must not touch the state once we start replacing it.
        self.inner.shared.supersede();
        self.inner.backend.stop();
        let track = task.track().to_string();
        if task.cancel_and_join(self.inner.config.join_timeout) {
            info!("Stopped playback of {track}");
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<PlaybackTask>> {
        match self.inner.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BackendCall, SimulatedBackend};
    use crate::db::MemoryStore;
    use crate::media::DirectoryLibrary;
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: Arc<SimulatedBackend>,
        engine: PlaybackEngine,
    }

    fn fixture_with(backend: SimulatedBackend, join_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for name in ["song.mp3", "song.mp3-direct", "outro.mp3"] {
            fs::write(dir.path().join(name), b"ID3").unwrap();
        }
        let backend = Arc::new(backend);
        let store = MemoryStore::with_mappings([
            ("0001", "song.mp3"),
            ("0002", "outro.mp3"),
            ("0003", "deleted.mp3"),
        ]);
        let engine = PlaybackEngine::new(
            backend.clone(),
            Arc::new(store),
            Arc::new(DirectoryLibrary::new(dir.path())),
            PlaybackConfig {
                join_timeout,
                poll_interval: Duration::from_millis(10),
                initial_volume: 25,
            },
        );
        Fixture {
            _dir: dir,
            backend,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            SimulatedBackend::new(Duration::from_secs(60)),
            Duration::from_secs(1),
        )
    }

    fn wait_for_state(engine: &PlaybackEngine, expected: &PlaybackState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if &engine.current_state() == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn audio_calls(backend: &SimulatedBackend) -> Vec<BackendCall> {
        backend
            .calls()
            .into_iter()
            .filter(|call| !matches!(call, BackendCall::SetVolume(_)))
            .collect()
    }

    #[test]
    fn switching_output_stops_playback_and_reapplies_volume() {
        let f = fixture();
        f.engine.set_volume(60);
        f.engine.play(&TagId::parse("0001").unwrap());
        assert!(wait_for_calls(&f.backend, 2));

        f.engine.set_output_device(Some("aux")).unwrap();
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);
        assert_eq!(f.engine.live_tasks(), 0);
        assert_eq!(f.engine.output_device().as_deref(), Some("aux"));
        assert_eq!(f.backend.output().as_deref(), Some("aux"));

        let calls = f.backend.calls();
        let switched = calls
            .iter()
            .position(|c| *c == BackendCall::SelectOutput(Some("aux".into())))
            .unwrap();
        assert_eq!(calls[switched + 1], BackendCall::SetVolume(60));
    }

    #[test]
    fn unavailable_output_is_reported_and_keeps_the_old_one() {
        let f = fixture_with(
            SimulatedBackend::new(Duration::from_secs(60)).with_outputs(["speaker"]),
            Duration::from_secs(1),
        );
        f.engine.set_output_device(Some("speaker")).unwrap();

        let err = f.engine.set_output_device(Some("aux")).unwrap_err();
        assert!(err.to_string().contains("aux device unavailable"));
        assert_eq!(f.engine.output_device().as_deref(), Some("speaker"));
        assert_eq!(f.engine.output_devices().unwrap(), vec!["speaker"]);

        // Playback still works on the old output.
        let state = f.engine.play(&TagId::parse("0001").unwrap());
        assert_eq!(state, PlaybackState::Playing("song.mp3".into()));
    }

    #[test]
    fn mapped_tag_starts_playing() {
        let f = fixture();
        let state = f.engine.play(&TagId::parse("0001").unwrap());
        assert_eq!(state, PlaybackState::Playing("song.mp3".into()));
        assert_eq!(f.engine.live_tasks(), 1);

        f.engine.stop();
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);
        assert_eq!(f.engine.live_tasks(), 0);
    }

    #[test]
    fn unknown_tag_reports_error_without_audio_io_then_recovers() {
        let f = fixture();
        let state = f.engine.play(&TagId::parse("9999").unwrap());
        assert_eq!(state, PlaybackState::Error("unknown id: 9999".into()));
        assert!(audio_calls(&f.backend).is_empty());

        let state = f.engine.play(&TagId::parse("0002").unwrap());
        assert_eq!(state, PlaybackState::Playing("outro.mp3".into()));
    }

    #[test]
    fn missing_media_file_reports_error() {
        let f = fixture();
        let state = f.engine.play(&TagId::parse("0003").unwrap());
        assert_eq!(state, PlaybackState::Error("file not found: deleted.mp3".into()));
        assert!(audio_calls(&f.backend).is_empty());
        assert_eq!(f.engine.live_tasks(), 0);
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let f = fixture();
        f.engine.stop();
        f.engine.stop();
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);
        assert!(audio_calls(&f.backend).is_empty());
    }

    #[test]
    fn direct_play_replaces_tag_playback() {
        let f = fixture();
        f.engine.play(&TagId::parse("0001").unwrap());
        assert!(wait_for_calls(&f.backend, 2));

        let started = Instant::now();
        let state = f.engine.play_file("song.mp3-direct");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(state, PlaybackState::Playing("song.mp3-direct".into()));
        assert_eq!(f.engine.live_tasks(), 1);

        // The old stream is stopped before the new one is loaded.
        assert!(wait_for_calls(&f.backend, 5));
        let calls = audio_calls(&f.backend);
        let stop_at = calls.iter().position(|c| *c == BackendCall::Stop).unwrap();
        let second_load = calls
            .iter()
            .rposition(|c| matches!(c, BackendCall::Load(_)))
            .unwrap();
        assert!(stop_at < second_load);
    }

    fn wait_for_calls(backend: &SimulatedBackend, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if audio_calls(backend).len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn natural_end_of_track_returns_to_idle() {
        let f = fixture_with(
            SimulatedBackend::new(Duration::from_millis(30)),
            Duration::from_secs(1),
        );
        f.engine.play_file("song.mp3");
        assert!(wait_for_state(&f.engine, &PlaybackState::Idle));
    }

    #[test]
    fn backend_failure_is_reported_through_state() {
        let f = fixture_with(
            SimulatedBackend::new(Duration::from_secs(60)).failing_loads(),
            Duration::from_secs(1),
        );
        f.engine.play(&TagId::parse("0001").unwrap());
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && !matches!(f.engine.current_state(), PlaybackState::Error(_))
        {
            thread::sleep(Duration::from_millis(5));
        }
        match f.engine.current_state() {
            PlaybackState::Error(message) => assert!(message.contains("unsupported format")),
            other => panic!("expected error state, got {other:?}"),
        }

        // The engine keeps working afterwards.
        f.engine.stop();
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);
    }

    #[test]
    fn wedged_backend_does_not_stall_stop() {
        let f = fixture_with(
            SimulatedBackend::new(Duration::from_secs(60)).with_load_delay(Duration::from_millis(400)),
            Duration::from_millis(50),
        );
        f.engine.play_file("song.mp3");
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        f.engine.stop();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);

        // The detached task finishes its load, sees the cancel, and leaves
        // the state alone.
        thread::sleep(Duration::from_millis(500));
        assert_eq!(f.engine.current_state(), PlaybackState::Idle);
        assert_eq!(f.engine.live_tasks(), 0);
        assert!(!f.backend.calls().contains(&BackendCall::Play));
    }

    #[test]
    fn stale_completion_does_not_clear_newer_playback() {
        let f = fixture_with(
            SimulatedBackend::new(Duration::from_millis(40)),
            Duration::from_secs(1),
        );
        f.engine.play_file("song.mp3");
        f.engine.play_file("song.mp3");
        // Replaying the same file: only the second task may clear the state.
        assert_eq!(f.engine.current_state(), PlaybackState::Playing("song.mp3".into()));
        assert!(wait_for_state(&f.engine, &PlaybackState::Idle));
    }

    #[test]
    fn concurrent_requests_never_run_two_tasks() {
        let f = fixture();
        let engine = f.engine.clone();
        let watcher = {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut max_live = 0;
                for _ in 0..200 {
                    max_live = max_live.max(engine.live_tasks());
                    thread::sleep(Duration::from_millis(1));
                }
                max_live
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        if (n + i) % 3 == 0 {
                            engine.stop();
                        } else if n % 2 == 0 {
                            engine.play(&TagId::parse("0001").unwrap());
                        } else {
                            engine.play_file("outro.mp3");
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(watcher.join().unwrap() <= 1);
        assert!(engine.live_tasks() <= 1);
    }

    #[test]
    fn volume_is_clamped_and_forwarded() {
        let f = fixture();
        assert_eq!(f.engine.volume(), 25);
        assert_eq!(f.engine.set_volume(130), 100);
        assert_eq!(f.backend.volume(), 100);
    }
}
