use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tagplayer_lib::audio::{BackendCall, SimulatedBackend};
use tagplayer_lib::db::{Database, MappingStore, MemoryStore};
use tagplayer_lib::media::{DirectoryLibrary, MediaLibrary};
use tagplayer_lib::models::{PlaybackState, TagId};
use tagplayer_lib::playback::{PlaybackConfig, PlaybackEngine};
use tagplayer_lib::reader::{ReaderConfig, SimulatedReader, SimulatedReaderHandle, TagSource};
use tagplayer_lib::registration::{CaptureOutcome, RegistrationConfig, Registrar};
use tagplayer_lib::session::{SessionConfig, SessionController, SessionGate};

struct Player {
    _media_dir: tempfile::TempDir,
    reader: SimulatedReaderHandle,
    backend: Arc<SimulatedBackend>,
    source: Arc<TagSource>,
    mappings: Arc<dyn MappingStore>,
    media: Arc<dyn MediaLibrary>,
    engine: PlaybackEngine,
    gate: SessionGate,
    controller: SessionController,
}

impl Player {
    async fn start(mappings: Arc<dyn MappingStore>, reader_config: ReaderConfig) -> Self {
        let media_dir = tempfile::tempdir().unwrap();
        for name in ["song.mp3", "story.mp3", "lullaby.mp3"] {
            fs::write(media_dir.path().join(name), b"ID3").unwrap();
        }

        let (device, reader) = SimulatedReader::new();
        let source = Arc::new(TagSource::new(Box::new(device), reader_config));
        let backend = Arc::new(SimulatedBackend::new(Duration::from_secs(60)));
        let media: Arc<dyn MediaLibrary> = Arc::new(DirectoryLibrary::new(media_dir.path()));
        let engine = PlaybackEngine::new(
            backend.clone(),
            Arc::clone(&mappings),
            Arc::clone(&media),
            PlaybackConfig {
                join_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
                initial_volume: 25,
            },
        );

        let gate = SessionGate::new();
        let mut controller = SessionController::new(gate.clone());
        controller
            .start(
                Arc::clone(&source),
                engine.clone(),
                SessionConfig {
                    tick_interval: Duration::from_millis(10),
                    debounce_delay: Duration::from_millis(30),
                    departure_threshold: 2,
                    error_backoff: Duration::from_millis(30),
                },
            )
            .await
            .unwrap();

        Self {
            _media_dir: media_dir,
            reader,
            backend,
            source,
            mappings,
            media,
            engine,
            gate,
            controller,
        }
    }

    async fn with_mappings(pairs: &[(&str, &str)]) -> Self {
        Self::start(
            Arc::new(MemoryStore::with_mappings(pairs.iter().copied())),
            quick_reader(),
        )
        .await
    }

    fn registrar(&self, read_timeout: Duration) -> Registrar {
        Registrar::new(
            Arc::clone(&self.source),
            self.engine.clone(),
            Arc::clone(&self.mappings),
            Arc::clone(&self.media),
            self.gate.clone(),
            RegistrationConfig {
                read_timeout,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    fn loads(&self) -> Vec<String> {
        self.backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Load(path) => path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for(&self, expected: PlaybackState) -> bool {
        wait_until(|| self.engine.current_state() == expected).await
    }

    async fn shutdown(mut self) {
        self.controller.stop().await.unwrap();
    }
}

fn quick_reader() -> ReaderConfig {
    ReaderConfig {
        max_consecutive_errors: 3,
        reinit_interval: Duration::from_secs(3600),
        reset_delay: Duration::ZERO,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn playing(file: &str) -> PlaybackState {
    PlaybackState::Playing(file.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tag_on_reader_plays_and_removal_stops() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;

    player.reader.present("0001");
    assert!(player.wait_for(playing("song.mp3")).await);

    player.reader.remove();
    assert!(player.wait_for(PlaybackState::Idle).await);
    assert_eq!(player.loads(), vec!["song.mp3"]);
    assert!(player.backend.calls().contains(&BackendCall::Stop));
    player.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tag_resting_on_reader_does_not_restart_track() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;

    player.reader.present("0001");
    assert!(player.wait_for(playing("song.mp3")).await);
    pause(200).await;

    assert_eq!(player.engine.current_state(), playing("song.mp3"));
    assert_eq!(player.loads(), vec!["song.mp3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn swapping_tags_switches_tracks() {
    let player = Player::with_mappings(&[("0001", "song.mp3"), ("0002", "story.mp3")]).await;

    player.reader.present("0001");
    assert!(player.wait_for(playing("song.mp3")).await);
    player.reader.remove();
    assert!(player.wait_for(PlaybackState::Idle).await);
    player.reader.present("0002");
    assert!(player.wait_for(playing("story.mp3")).await);

    assert_eq!(player.loads(), vec!["song.mp3", "story.mp3"]);
    assert!(wait_until(|| player.engine.live_tasks() <= 1).await);
    player.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_tag_reports_error_without_audio() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;

    player.reader.present("7777");
    assert!(player.wait_for(PlaybackState::Error("unknown id: 7777".into())).await);
    assert!(player.loads().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mapping_to_deleted_file_reports_missing_media() {
    let player = Player::with_mappings(&[("0003", "gone.mp3")]).await;

    player.reader.present("0003");
    assert!(player.wait_for(PlaybackState::Error("file not found: gone.mp3".into())).await);
    assert!(player.loads().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_faults_are_recovered_without_stopping_the_loop() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;

    player.reader.fail_next(3);
    player.reader.present("0001");
    assert!(player.wait_for(playing("song.mp3")).await);
    assert!(player.reader.reinit_count() >= 1);
    assert_eq!(player.source.health().consecutive_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_play_pauses_tag_playback_until_released() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;

    let direct = player.gate.suspend();
    assert_eq!(player.engine.play_file("lullaby.mp3"), playing("lullaby.mp3"));

    player.reader.present("0001");
    pause(150).await;
    assert_eq!(player.engine.current_state(), playing("lullaby.mp3"));

    player.engine.stop();
    drop(direct);
    assert!(player.wait_for(playing("song.mp3")).await);
    assert_eq!(player.loads(), vec!["lullaby.mp3", "song.mp3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_binds_tag_that_then_plays() {
    let player = Player::with_mappings(&[]).await;
    let registrar = player.registrar(Duration::from_secs(5));

    let hold = registrar.hold();
    player.reader.present("0042");
    let tag = match registrar.capture_tag().await {
        CaptureOutcome::Captured { tag, existing } => {
            assert_eq!(existing, None);
            tag
        }
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(tag, TagId::parse("0042").unwrap());
    registrar.commit(&tag, "story.mp3").unwrap();

    // Nothing plays while the flow holds the reader.
    pause(100).await;
    assert_eq!(player.engine.current_state(), PlaybackState::Idle);

    drop(hold);
    assert!(player.wait_for(playing("story.mp3")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_registration_returns_promptly_and_changes_nothing() {
    let player = Player::with_mappings(&[("0001", "song.mp3")]).await;
    let registrar = player.registrar(Duration::from_secs(30));
    let cancel = registrar.cancel_handle();

    let canceller = tokio::spawn(async move {
        pause(50).await;
        cancel.cancel();
    });

    let started = Instant::now();
    assert_eq!(registrar.capture_tag().await, CaptureOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    canceller.await.unwrap();

    assert_eq!(player.mappings.list().unwrap().len(), 1);
    assert!(player.gate.is_enabled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_mappings_drive_playback() {
    let db_dir = tempfile::tempdir().unwrap();
    let database = Database::new(db_dir.path().join("tags.sqlite3")).unwrap();
    database.upsert(&TagId::parse("0001").unwrap(), "song.mp3").unwrap();

    let player = Player::start(Arc::new(database), quick_reader()).await;
    player.reader.present("0001");
    assert!(player.wait_for(playing("song.mp3")).await);
}
