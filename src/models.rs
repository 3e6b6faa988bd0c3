use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const UNKNOWN_TRACK_TITLE: &str = "Unknown title";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLabel {
    YouTube,
    Spotify,
    SoundCloud,
    Other,
}

impl SourceLabel {
    pub fn from_url(url: &str) -> Self {
        if url.contains("spotify.com") {
            SourceLabel::Spotify
        } else if url.contains("soundcloud.com") || url.contains("snd.sc") {
            SourceLabel::SoundCloud
        } else if url.contains("youtube.com") || url.contains("youtu.be") {
            SourceLabel::YouTube
        } else {
            SourceLabel::Other
        }
    }
}

impl fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceLabel::YouTube => "YouTube",
            SourceLabel::Spotify => "Spotify",
            SourceLabel::SoundCloud => "SoundCloud",
            SourceLabel::Other => "Web",
        };

        f.write_str(label)
    }
}

/// A resolved, playable item. Built once by a resolver and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    /// Page URL of the item, used for display and repeat detection.
    pub url: String,
    pub requester: String,
    /// `None` for live or otherwise indeterminate streams.
    pub duration: Option<Duration>,
    pub source: SourceLabel,
    /// Direct media URL, possibly short-lived.
    pub stream_url: String,
    pub headers: HashMap<String, String>,
}

/// One stored or listed playlist item. `query` is what gets handed back to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub title: String,
    pub query: String,
    pub url: String,
}

impl PlaylistEntry {
    /// The most precise thing to resolve: the URL when there is one, the query otherwise.
    pub fn lookup(&self) -> &str {
        if self.url.is_empty() {
            &self.query
        } else {
            &self.url
        }
    }
}

impl From<&Track> for PlaylistEntry {
    fn from(track: &Track) -> Self {
        PlaylistEntry {
            title: track.title.clone(),
            query: track.url.clone(),
            url: track.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_label_is_guessed_from_url() {
        assert_eq!(SourceLabel::from_url("https://www.youtube.com/watch?v=abc"), SourceLabel::YouTube);
        assert_eq!(SourceLabel::from_url("https://youtu.be/abc"), SourceLabel::YouTube);
        assert_eq!(SourceLabel::from_url("https://soundcloud.com/artist/song"), SourceLabel::SoundCloud);
        assert_eq!(SourceLabel::from_url("https://open.spotify.com/track/123"), SourceLabel::Spotify);
        assert_eq!(SourceLabel::from_url("https://example.com/radio.mp3"), SourceLabel::Other);
    }

    #[test]
    fn playlist_entry_prefers_url_for_lookup() {
        let entry = PlaylistEntry {
            title: "Song".to_string(),
            query: "artist song".to_string(),
            url: String::new(),
        };
        assert_eq!(entry.lookup(), "artist song");

        let entry = PlaylistEntry { url: "https://youtu.be/x".to_string(), ..entry };
        assert_eq!(entry.lookup(), "https://youtu.be/x");
    }
}
