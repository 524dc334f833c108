//! Line-based front end for the player.
//!
//! Stdin is read on its own thread so that `cancel` reaches a registration
//! that is blocked waiting for a tag. In simulate mode the same thread
//! places and removes tags on the simulated reader.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::runtime::Handle;

use crate::db::MappingStore;
use crate::media::MediaLibrary;
use crate::playback::PlaybackEngine;
use crate::reader::{SimulatedReaderHandle, TagSource};
use crate::registration::{CaptureCancel, CaptureOutcome, Registrar};
use crate::session::{SessionGate, SuspendGuard};
use crate::settings::SettingsStore;
use crate::ui::{FileMenu, UiIntent};

/// Rows of the file menu shown at once.
const MENU_ROWS: usize = 4;

const HELP: &str = "\
commands:
  status             current state, volume and reader health
  list               stored tag mappings
  files              files in the media directory
  play <n|file>      play a file directly (pauses tag playback)
  stop               stop playback and resume tag playback
  register           bind the next tag to a file
  volume [n|+|-]     show or change the volume
  output [name]      list outputs or switch to one (`default` for the system one)
  tag <id> / untag   place or remove a tag (simulate mode)
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleCommand {
    Status,
    List,
    Files,
    Play(String),
    Stop,
    Register,
    Volume(Option<VolumeChange>),
    Output(Option<OutputChoice>),
    Help,
    Quit,
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeChange {
    Set(u8),
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputChoice {
    Default,
    Named(String),
}

impl OutputChoice {
    fn name(&self) -> Option<&str> {
        match self {
            OutputChoice::Default => None,
            OutputChoice::Named(name) => Some(name),
        }
    }
}

const VOLUME_STEP: u8 = 5;

fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    if line.is_empty() || line == "cancel" {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "status" | "s" => ConsoleCommand::Status,
        "list" | "l" => ConsoleCommand::List,
        "files" | "f" => ConsoleCommand::Files,
        "play" | "p" if !rest.is_empty() => ConsoleCommand::Play(rest.to_string()),
        "stop" => ConsoleCommand::Stop,
        "register" | "r" => ConsoleCommand::Register,
        "volume" | "v" => ConsoleCommand::Volume(match rest {
            "" => None,
            "+" => Some(VolumeChange::Up),
            "-" => Some(VolumeChange::Down),
            value => match value.parse::<u8>() {
                Ok(volume) => Some(VolumeChange::Set(volume)),
                Err(_) => return Some(ConsoleCommand::Unknown(line.to_string())),
            },
        }),
        "output" | "o" => ConsoleCommand::Output(match rest {
            "" => None,
            "default" => Some(OutputChoice::Default),
            name => Some(OutputChoice::Named(name.to_string())),
        }),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => ConsoleCommand::Unknown(line.to_string()),
    };
    Some(command)
}

/// Menu keys: `k`/`up`, `j`/`down`, empty or `ok` to confirm, `cancel`.
fn parse_intent(line: &str) -> Option<UiIntent> {
    match line.trim() {
        "" | "ok" | "y" | "yes" => Some(UiIntent::ConfirmSelection),
        "cancel" | "c" | "n" | "no" => Some(UiIntent::CancelRegistration),
        "k" | "up" => Some(UiIntent::Navigate(-1)),
        "j" | "down" => Some(UiIntent::Navigate(1)),
        _ => None,
    }
}

/// Everything the console drives.
pub struct Console {
    pub engine: PlaybackEngine,
    pub registrar: Registrar,
    pub mappings: Arc<dyn MappingStore>,
    pub media: Arc<dyn MediaLibrary>,
    pub source: Arc<TagSource>,
    pub gate: SessionGate,
    pub settings: Arc<SettingsStore>,
    pub simulated: Option<SimulatedReaderHandle>,
    /// Runtime the registration capture runs on.
    pub runtime: Handle,
}

impl Console {
    /// Runs until `quit` or end of input.
    pub fn run(self) -> Result<()> {
        let lines = spawn_stdin_reader(self.registrar.cancel_handle(), self.simulated.clone())?;
        let mut direct: Option<SuspendGuard> = None;

        println!("{HELP}");
        prompt();
        while let Ok(line) = lines.recv() {
            // A direct track that ended on its own hands the reader back.
            if direct.is_some() && !self.engine.current_state().is_playing() {
                direct = None;
            }

            let Some(command) = parse_command(&line) else {
                prompt();
                continue;
            };

            match command {
                ConsoleCommand::Quit => break,
                ConsoleCommand::Help => println!("{HELP}"),
                ConsoleCommand::Status => self.print_status(direct.is_some()),
                ConsoleCommand::List => self.print_mappings(),
                ConsoleCommand::Files => self.print_files(),
                ConsoleCommand::Play(target) => {
                    if let Some(file) = self.resolve_file(&target) {
                        direct.get_or_insert_with(|| self.gate.suspend());
                        let state = self.engine.play_file(&file);
                        info!("Direct playback: {}", state.describe());
                    }
                }
                ConsoleCommand::Stop => {
                    self.engine.stop();
                    direct = None;
                }
                ConsoleCommand::Register => {
                    if let Err(err) = self.register(&lines) {
                        warn!("Registration failed: {err:#}");
                        println!("registration failed: {err:#}");
                    }
                }
                ConsoleCommand::Volume(change) => self.change_volume(change),
                ConsoleCommand::Output(choice) => {
                    self.change_output(choice);
                    direct = None;
                }
                ConsoleCommand::Unknown(text) => println!("unknown command: {text} (try help)"),
            }
            prompt();
        }

        Ok(())
    }

    fn print_status(&self, direct: bool) {
        let health = self.source.health();
        println!("{}", self.engine.current_state().describe());
        println!("volume: {}%", self.engine.volume());
        println!(
            "output: {}",
            self.engine.output_device().as_deref().unwrap_or("default")
        );
        println!(
            "tag playback: {}",
            if direct { "paused (direct play)" } else { "active" }
        );
        println!(
            "reader: {} errors in a row, {} resets, last read {}",
            health.consecutive_errors,
            health.resets,
            match health.ms_since_success {
                Some(ms) => format!("{:.1}s ago", ms as f64 / 1000.0),
                None => "never".to_string(),
            }
        );
    }

    fn print_mappings(&self) {
        match self.mappings.list() {
            Ok(mappings) if mappings.is_empty() => println!("no mappings yet"),
            Ok(mappings) => {
                for mapping in mappings {
                    println!("{} -> {}", mapping.tag, mapping.file);
                }
            }
            Err(err) => println!("could not read mappings: {err:#}"),
        }
    }

    fn print_files(&self) {
        match self.media.list_files() {
            Ok(files) if files.is_empty() => println!("no files in media directory"),
            Ok(files) => {
                for (index, file) in files.iter().enumerate() {
                    println!("{:>3}  {file}", index + 1);
                }
            }
            Err(err) => println!("could not list files: {err:#}"),
        }
    }

    /// Accepts a 1-based index from `files` or a file name.
    fn resolve_file(&self, target: &str) -> Option<String> {
        if let Ok(index) = target.parse::<usize>() {
            let files = self.media.list_files().unwrap_or_default();
            return match index.checked_sub(1).and_then(|i| files.get(i)) {
                Some(file) => Some(file.clone()),
                None => {
                    println!("no file number {index}");
                    None
                }
            };
        }
        Some(target.to_string())
    }

    fn change_volume(&self, change: Option<VolumeChange>) {
        let current = self.engine.volume();
        let target = match change {
            None => {
                println!("volume: {current}%");
                return;
            }
            Some(VolumeChange::Set(volume)) => volume,
            Some(VolumeChange::Up) => current.saturating_add(VOLUME_STEP),
            Some(VolumeChange::Down) => current.saturating_sub(VOLUME_STEP),
        };
        let applied = self.engine.set_volume(target);
        if let Err(err) = self.settings.update_volume(applied) {
            warn!("Could not persist volume: {err:#}");
        }
        println!("volume: {applied}%");
    }

    fn change_output(&self, choice: Option<OutputChoice>) {
        let Some(choice) = choice else {
            let current = self.engine.output_device();
            match self.engine.output_devices() {
                Ok(outputs) => {
                    for output in outputs {
                        let marker = if current.as_deref() == Some(output.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!("{marker} {output}");
                    }
                    println!("{} default", if current.is_none() { "*" } else { " " });
                }
                Err(err) => println!("could not list outputs: {err}"),
            }
            return;
        };

        let label = choice.name().unwrap_or("default").to_string();
        match self.engine.set_output_device(choice.name()) {
            Ok(()) => {
                if let Err(err) = self.settings.update_output_device(choice.name()) {
                    warn!("Could not persist output device: {err:#}");
                }
                println!("output: {label}");
            }
            Err(err) => println!("could not switch output: {err}"),
        }
    }

    fn register(&self, lines: &Receiver<String>) -> Result<()> {
        let files = self.registrar.available_files()?;
        let _hold = self.registrar.hold();

        println!("place a tag on the reader (type cancel to abort)");
        let (tag, existing) = match self.runtime.block_on(self.registrar.capture_tag()) {
            CaptureOutcome::Captured { tag, existing } => (tag, existing),
            CaptureOutcome::TimedOut => {
                println!("no tag detected");
                return Ok(());
            }
            CaptureOutcome::Cancelled => {
                println!("registration cancelled");
                return Ok(());
            }
        };
        drain(lines);

        println!("tag {tag}");
        if let Some(existing) = existing {
            println!("already mapped to {existing}; overwrite? [y/n]");
            match next_intent(lines) {
                Some(UiIntent::ConfirmSelection) => {}
                _ => {
                    println!("kept {tag} -> {existing}");
                    return Ok(());
                }
            }
        }

        let mut menu = FileMenu::new(files);
        loop {
            render_menu(&menu);
            match next_intent(lines) {
                Some(UiIntent::Navigate(delta)) => menu.navigate(delta),
                Some(UiIntent::ConfirmSelection) => break,
                Some(UiIntent::CancelRegistration) | None => {
                    println!("registration cancelled");
                    return Ok(());
                }
            }
        }

        let file = menu
            .selected()
            .context("file menu is empty")?
            .to_string();
        self.registrar.commit(&tag, &file)?;
        println!("{tag} -> {file}");
        Ok(())
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn render_menu(menu: &FileMenu) {
    println!("files ({}/{}), j/k to move, enter to pick:", menu.cursor() + 1, menu.items().len());
    for (selected, item) in menu.window(MENU_ROWS) {
        println!("{} {item}", if selected { ">" } else { " " });
    }
}

/// Next menu intent, skipping lines that are not menu keys. `None` once
/// stdin is closed.
fn next_intent(lines: &Receiver<String>) -> Option<UiIntent> {
    loop {
        let line = lines.recv().ok()?;
        match parse_intent(&line) {
            Some(intent) => return Some(intent),
            None => println!("j/k to move, enter to confirm, cancel to abort"),
        }
    }
}

/// Drops input typed while the reader was being watched.
fn drain(lines: &Receiver<String>) {
    while lines.try_recv().is_ok() {}
}

fn spawn_stdin_reader(
    cancel: CaptureCancel,
    simulated: Option<SimulatedReaderHandle>,
) -> Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("tagplayer-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let trimmed = line.trim();

                if trimmed == "cancel" {
                    cancel.cancel();
                }
                if let Some(reader) = &simulated {
                    if let Some(id) = trimmed.strip_prefix("tag ") {
                        reader.present(id);
                        continue;
                    }
                    if trimmed == "untag" {
                        reader.remove();
                        continue;
                    }
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}
