use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Plays audio files when RFID tags are placed on the reader.
#[derive(Parser, Debug)]
#[command(name = "tagplayer")]
#[command(version)]
pub struct Cli {
    /// JSON settings file; created on the first volume change
    #[arg(long, default_value = "tagplayer.json", env = "TAGPLAYER_SETTINGS", global = true)]
    pub settings: PathBuf,

    /// Directory holding the audio files
    #[arg(long, global = true)]
    pub media_dir: Option<PathBuf>,

    /// SQLite file with the tag mappings
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Reader device that prints one tag id per line
    #[arg(long, global = true)]
    pub device: Option<PathBuf>,

    /// Use the simulated reader and audio output instead of hardware
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Log filter (error, warn, info, debug, trace); RUST_LOG still applies
    #[arg(long, global = true)]
    pub log_level: Option<log::LevelFilter>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the player with the interactive console (default)
    Run,
    /// Bind a tag to a file in the media directory
    Map { tag: String, file: String },
    /// Print every stored mapping
    Mappings,
    /// Print the files in the media directory
    Files,
    /// Wait for one tag on the reader and print its id
    Scan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_without_subcommand() {
        let cli = Cli::try_parse_from(["tagplayer", "--simulate"]).unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.command, None);
        assert_eq!(cli.settings, PathBuf::from("tagplayer.json"));
    }

    #[test]
    fn parses_map_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tagplayer",
            "map",
            "0001",
            "song.mp3",
            "--media-dir",
            "/mnt/usb",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Map {
                tag: "0001".into(),
                file: "song.mp3".into(),
            })
        );
        assert_eq!(cli.media_dir, Some(PathBuf::from("/mnt/usb")));
        assert_eq!(cli.log_level, Some(log::LevelFilter::Debug));
    }
}
