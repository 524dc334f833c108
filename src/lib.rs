pub mod audio;
pub mod cli;
mod console;
pub mod db;
pub mod error;
pub mod media;
pub mod models;
pub mod playback;
pub mod reader;
pub mod registration;
pub mod session;
pub mod settings;
pub mod ui;
pub mod utils;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use audio::{AudioBackend, RodioBackend, SimulatedBackend};
use cli::{Cli, Command};
use console::Console;
use db::{Database, MappingStore};
use media::{DirectoryLibrary, MediaLibrary};
use models::TagId;
use playback::PlaybackEngine;
use reader::{LineDeviceReader, ReaderDevice, SimulatedReader, SimulatedReaderHandle, TagSource};
use registration::Registrar;
use session::{SessionController, SessionGate};
use settings::{Settings, SettingsStore};
use ui::{ConsoleView, UiObserver};

/// Length of every "track" when running without a sound device.
const SIMULATED_TRACK_LENGTH: Duration = Duration::from_secs(30);

pub fn run(cli: Cli) -> Result<()> {
    // RUST_LOG wins over the default level; --log-level wins over both.
    let mut logger = env_logger::Builder::new();
    logger.filter_level(log::LevelFilter::Info).parse_default_env();
    if let Some(level) = cli.log_level {
        logger.filter_level(level);
    }
    logger.init();

    info!("tagplayer starting up...");

    let store = Arc::new(
        SettingsStore::new(cli.settings.clone())
            .with_context(|| format!("failed to load settings from {}", cli.settings.display()))?,
    );
    store.override_with(|settings| {
        settings.apply_overrides(|key| std::env::var(key).ok());
        apply_cli_overrides(settings, &cli);
    });
    let settings = store.current();
    info!("Settings loaded from {}", store.path().display());

    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_player(&settings, store, cli.simulate),
        Command::Map { tag, file } => map_tag(&settings, &tag, &file),
        Command::Mappings => print_mappings(&settings),
        Command::Files => print_files(&settings),
        Command::Scan => scan(&settings, cli.simulate),
    }
}

fn apply_cli_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(path) = &cli.media_dir {
        settings.media_path = path.clone();
    }
    if let Some(path) = &cli.database {
        settings.database_path = path.clone();
    }
    if let Some(path) = &cli.device {
        settings.reader_device = path.clone();
    }
}

fn open_database(path: &Path) -> Result<Arc<dyn MappingStore>> {
    let database = Database::new(path.to_path_buf())
        .with_context(|| format!("failed to open mapping database {}", path.display()))?;
    log::debug!("Mappings stored in {}", database.path().display());
    Ok(Arc::new(database))
}

fn open_reader(
    settings: &Settings,
    simulate: bool,
) -> (Box<dyn ReaderDevice>, Option<SimulatedReaderHandle>) {
    if simulate {
        info!("Using simulated reader; type `tag <id>` and `untag` to drive it");
        let (reader, handle) = SimulatedReader::new();
        (Box::new(reader), Some(handle))
    } else {
        info!("Using reader at {}", settings.reader_device.display());
        let reader = LineDeviceReader::new(&settings.reader_device, settings.presence_window());
        (Box::new(reader), None)
    }
}

fn run_player(settings: &Settings, store: Arc<SettingsStore>, simulate: bool) -> Result<()> {
    let mappings = open_database(&settings.database_path)?;
    let media: Arc<dyn MediaLibrary> = Arc::new(DirectoryLibrary::new(&settings.media_path));
    match media.list_files() {
        Ok(files) => info!(
            "{} audio files in {}",
            files.len(),
            settings.media_path.display()
        ),
        Err(err) => warn!("Could not list media directory: {err:#}"),
    }

    let backend: Arc<dyn AudioBackend> = if simulate {
        Arc::new(SimulatedBackend::new(SIMULATED_TRACK_LENGTH))
    } else {
        Arc::new(RodioBackend::new())
    };

    let (device, simulated) = open_reader(settings, simulate);
    let source = Arc::new(TagSource::new(device, settings.reader()));
    let engine = PlaybackEngine::new(
        backend,
        Arc::clone(&mappings),
        Arc::clone(&media),
        settings.playback(),
    );
    if let Some(name) = settings.output_device.as_deref() {
        if let Err(err) = engine.set_output_device(Some(name)) {
            warn!("Staying on the default output: {err}");
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tagplayer-rt")
        .build()
        .context("failed to start async runtime")?;

    let gate = SessionGate::new();
    let mut controller = SessionController::new(gate.clone());
    let mut observer = runtime.block_on(async {
        controller
            .start(Arc::clone(&source), engine.clone(), settings.session())
            .await?;
        anyhow::Ok(UiObserver::spawn(
            engine.clone(),
            Box::new(ConsoleView::new()),
            settings.ui_refresh_hz(),
        ))
    })?;

    let registrar = Registrar::new(
        Arc::clone(&source),
        engine.clone(),
        Arc::clone(&mappings),
        Arc::clone(&media),
        gate.clone(),
        settings.registration(),
    );

    let console = Console {
        engine: engine.clone(),
        registrar,
        mappings,
        media,
        source,
        gate,
        settings: store,
        simulated,
        runtime: runtime.handle().clone(),
    };
    let result = console.run();

    info!("Shutting down");
    runtime.block_on(async {
        if let Err(err) = controller.stop().await {
            warn!("Session loop did not stop cleanly: {err:#}");
        }
        if let Err(err) = observer.stop().await {
            warn!("UI task did not stop cleanly: {err:#}");
        }
    });
    engine.stop();
    result
}

fn map_tag(settings: &Settings, tag: &str, file: &str) -> Result<()> {
    let tag: TagId = tag.parse()?;
    let media = DirectoryLibrary::new(&settings.media_path);
    if !media.contains(file) {
        bail!(error::Error::MediaMissing(file.to_string()));
    }

    let mappings = open_database(&settings.database_path)?;
    match mappings.upsert(&tag, file)? {
        Some(previous) => println!("{tag} -> {file} (was {previous})"),
        None => println!("{tag} -> {file}"),
    }
    Ok(())
}

fn print_mappings(settings: &Settings) -> Result<()> {
    let mappings = open_database(&settings.database_path)?.list()?;
    if mappings.is_empty() {
        println!("no mappings in {}", settings.database_path.display());
    }
    for mapping in mappings {
        println!(
            "{}\t{}\t{}",
            mapping.tag,
            mapping.file,
            mapping.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

fn print_files(settings: &Settings) -> Result<()> {
    let media = DirectoryLibrary::new(&settings.media_path);
    for file in media.list_files()? {
        println!("{file}");
    }
    Ok(())
}

fn scan(settings: &Settings, simulate: bool) -> Result<()> {
    if simulate {
        bail!("scan needs a real reader; drop --simulate");
    }
    let (device, _) = open_reader(settings, false);
    let source = TagSource::new(device, settings.reader());
    println!("place a tag on the reader...");
    match source.read_blocking() {
        Some(tag) => {
            println!("{tag}");
            Ok(())
        }
        None => bail!("reader failed before a tag was read"),
    }
}
