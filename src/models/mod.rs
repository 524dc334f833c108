pub mod playback;
pub mod tag;

pub use playback::PlaybackState;
pub use tag::TagId;
