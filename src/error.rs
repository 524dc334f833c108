//! Error taxonomy for the playback controller.
//!
//! Most of these never reach a caller: reader faults are absorbed by
//! [`crate::reader::TagSource`] and playback faults become
//! [`crate::models::PlaybackState::Error`]. They are still typed so the
//! message shown on the display and in the log is consistent.

use thiserror::Error;

use crate::models::TagId;

#[derive(Error, Debug)]
pub enum Error {
    /// Reader I/O failed. Recovered by resetting the device.
    #[error("reader hardware fault: {0}")]
    HardwareFault(String),

    /// Reader or user text held no tag id.
    #[error("tag id must not be empty")]
    BlankTag,

    /// No mapping exists for the presented tag.
    #[error("unknown id: {0}")]
    UnknownTag(TagId),

    /// The mapped file is not in the media directory.
    #[error("file not found: {0}")]
    MediaMissing(String),

    /// The audio backend failed to load or play a track.
    #[error("playback failed: {0}")]
    PlaybackBackend(String),

    /// The mapping store could not be queried or updated.
    #[error("mapping store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::HardwareFault(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
