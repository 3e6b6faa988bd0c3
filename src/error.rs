use std::time::Duration;

use thiserror::Error;

use crate::display::clock;

/// Everything a player command can fail with. The `Display` text is what users get to read.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("The queue is full ({capacity} tracks).")]
    QueueFull { capacity: usize },

    #[error("Could not get audio: {0}")]
    Resolution(#[from] ResolveError),

    #[error("You don't have permission to use this command.")]
    PermissionDenied,

    #[error(transparent)]
    InvalidSeek(#[from] SeekError),

    #[error("Not connected to a voice channel.")]
    NotConnected,

    #[error("Join my voice channel to vote.")]
    NotListening,

    #[error("Nothing is playing.")]
    NothingPlaying,

    #[error("Nothing is paused.")]
    NotPaused,

    #[error("Volume must be between 0 and 100 (got {0}).")]
    InvalidVolume(u32),

    #[error("Playlist `{0}` does not exist.")]
    PlaylistNotFound(String),

    #[error("Playlist storage failed: {0}")]
    Storage(#[from] StoreError),

    #[error("Voice playback failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no results found")]
    NoResults,

    #[error("resolution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("unable to fetch a stream URL")]
    MissingStream,

    #[error("unsupported link: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("Timestamp {} is out of range for this track ({}).", clock(.target), clock(.duration))]
    OutOfRange { target: Duration, duration: Duration },

    #[error("Rewind must be earlier than the current time.")]
    NotEarlier,

    #[error("Fast-forward must be later than the current time.")]
    NotLater,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
