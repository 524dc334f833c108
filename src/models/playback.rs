use serde::{Deserialize, Serialize};

/// What the controller is doing right now, as shown on the display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "status", content = "detail")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing(String),
    Error(String),
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing(_))
    }

    pub fn track(&self) -> Option<&str> {
        match self {
            PlaybackState::Playing(track) => Some(track),
            _ => None,
        }
    }

    /// Single-line form used by the console view and the status command.
    pub fn describe(&self) -> String {
        match self {
            PlaybackState::Idle => "Nothing playing".to_string(),
            PlaybackState::Playing(track) => format!("Playing: {track}"),
            PlaybackState::Error(message) => format!("Error: {message}"),
        }
    }
}
