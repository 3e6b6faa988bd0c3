//! [`Resolver`] backed by the `yt-dlp` executable.
//!
//! Every lookup runs `yt-dlp -j` and reads one JSON document per line from stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::models::{PlaylistEntry, SourceLabel, Track, UNKNOWN_TRACK_TITLE};
use crate::resolver::{is_url, Resolver};

const YTDLP: &str = "yt-dlp";

/// A fully extracted item, as printed by `yt-dlp -j`.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    /// Direct media URL of the selected format.
    url: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

/// A playlist item, as printed by `yt-dlp -j --flat-playlist`.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    ie_key: Option<String>,
}

pub struct YtDlp {
    cookies: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(cookies: Option<PathBuf>) -> Self {
        if let Some(cookies) = &cookies {
            info!(path = %cookies.display(), "Using cookies for yt-dlp");
        }

        Self { cookies }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(YTDLP);
        command
            .arg("-j")
            .arg("--no-warnings")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }

        command
    }

    async fn run(&self, mut command: Command) -> Result<String, ResolveError> {
        let output = command
            .output()
            .await
            .map_err(|why| ResolveError::Backend(format!("could not run {YTDLP}: {why}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("unknown error");

            return Err(ResolveError::Backend(reason.trim().to_string()));
        }

        Ok(stdout)
    }

    async fn flat_playlist(&self, url: &str, limit: usize) -> Result<Vec<PlaylistEntry>, ResolveError> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--playlist-end")
            .arg(limit.to_string())
            .arg(url);

        let stdout = self.run(command).await?;
        let entries = parse_flat_playlist(&stdout, limit);

        debug!(url, entries = entries.len(), "Flat playlist read");

        Ok(entries)
    }
}

#[async_trait]
impl Resolver for YtDlp {
    async fn resolve(&self, query: &str, requester: &str) -> Result<Track, ResolveError> {
        let query = query.trim();

        if query.is_empty() {
            return Err(ResolveError::NoResults);
        }

        if SourceLabel::from_url(query) == SourceLabel::Spotify {
            return Err(ResolveError::Unsupported(query.to_string()));
        }

        let target = if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{query}")
        };

        let mut command = self.command();
        command
            .arg("--no-playlist")
            .arg("-f")
            .arg("bestaudio/best")
            .arg(&target);

        let stdout = self.run(command).await?;
        let track = parse_track(&stdout, requester)?;

        info!(query, title = %track.title, "Resolved");

        Ok(track)
    }

    async fn fetch_playlist_entries(&self, url: &str, limit: usize) -> Result<Vec<PlaylistEntry>, ResolveError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        if SourceLabel::from_url(url) == SourceLabel::Spotify {
            return Err(ResolveError::Unsupported(url.to_string()));
        }

        let entries = self.flat_playlist(url, limit).await?;

        if entries.is_empty() {
            Err(ResolveError::NoResults)
        } else {
            Ok(entries)
        }
    }

    async fn related(&self, seed: &Track, limit: usize) -> Result<Vec<PlaylistEntry>, ResolveError> {
        let url = match youtube_video_id(&seed.url) {
            Some(id) => format!("https://www.youtube.com/watch?v={id}&list=RD{id}"),
            None => {
                debug!(seed = %seed.url, "No related mix for a non YouTube track");
                return Ok(Vec::new());
            }
        };

        // The mix starts with the seed itself.
        self.flat_playlist(&url, limit + 1).await
    }
}

fn parse_track(stdout: &str, requester: &str) -> Result<Track, ResolveError> {
    let info: VideoInfo = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| match serde_json::from_str(line) {
            Ok(info) => Some(info),
            Err(why) => {
                warn!("Skipping unreadable yt-dlp output: {why}");
                None
            }
        })
        .ok_or(ResolveError::NoResults)?;

    let stream_url = info.url.filter(|url| !url.is_empty()).ok_or(ResolveError::MissingStream)?;
    let url = info
        .webpage_url
        .or(info.original_url)
        .unwrap_or_else(|| stream_url.clone());

    let duration = match info.is_live {
        Some(true) => None,
        _ => info
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(Duration::from_secs_f64),
    };

    Ok(Track {
        title: info.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
        source: SourceLabel::from_url(&url),
        url,
        requester: requester.to_string(),
        duration,
        stream_url,
        headers: info.http_headers,
    })
}

fn parse_flat_playlist(stdout: &str, limit: usize) -> Vec<PlaylistEntry> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let entry: FlatEntry = serde_json::from_str(line).ok()?;

            let url = match (entry.url, entry.id, entry.ie_key.as_deref()) {
                (Some(url), _, _) if is_url(&url) => url,
                (_, Some(id), Some("Youtube") | None) => format!("https://www.youtube.com/watch?v={id}"),
                (Some(url), _, _) => url,
                _ => return None,
            };

            let title = entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string());

            Some(PlaylistEntry {
                query: title.clone(),
                title,
                url,
            })
        })
        .take(limit)
        .collect()
}

fn youtube_video_id(url: &str) -> Option<&str> {
    let id = if let Some((_, rest)) = url.split_once("youtu.be/") {
        rest
    } else if let Some((_, rest)) = url.split_once("v=") {
        rest
    } else {
        return None;
    };

    let id = id.split(|c| c == '&' || c == '?' || c == '#' || c == '/').next()?;

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_is_read_from_full_info() {
        let stdout = r#"{"title": "Song", "webpage_url": "https://www.youtube.com/watch?v=abc", "url": "https://media.example/abc", "duration": 212.0, "http_headers": {"User-Agent": "x"}}"#;

        let track = parse_track(stdout, "alice").unwrap();

        assert_eq!(track.title, "Song");
        assert_eq!(track.url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(track.stream_url, "https://media.example/abc");
        assert_eq!(track.duration, Some(Duration::from_secs(212)));
        assert_eq!(track.source, SourceLabel::YouTube);
        assert_eq!(track.requester, "alice");
        assert_eq!(track.headers.get("User-Agent").map(String::as_str), Some("x"));
    }

    #[test]
    fn live_streams_have_no_duration() {
        let stdout = r#"{"title": "Radio", "webpage_url": "https://example.com/live", "url": "https://media.example/live", "duration": 0, "is_live": true}"#;

        let track = parse_track(stdout, "bob").unwrap();

        assert_eq!(track.duration, None);
        assert_eq!(track.source, SourceLabel::Other);
    }

    #[test]
    fn missing_stream_url_is_an_error() {
        let stdout = r#"{"title": "Song", "webpage_url": "https://www.youtube.com/watch?v=abc"}"#;

        assert!(matches!(parse_track(stdout, "alice"), Err(ResolveError::MissingStream)));
        assert!(matches!(parse_track("", "alice"), Err(ResolveError::NoResults)));
    }

    #[test]
    fn flat_playlist_lines_become_entries() {
        let stdout = concat!(
            r#"{"_type": "url", "ie_key": "Youtube", "id": "a1", "url": "a1", "title": "First"}"#,
            "\n",
            "garbage\n",
            r#"{"_type": "url", "id": "b2", "url": "https://soundcloud.com/x/b2", "title": "Second"}"#,
            "\n",
            r#"{"_type": "url", "ie_key": "Youtube", "id": "c3", "title": "Third"}"#,
            "\n",
        );

        let entries = parse_flat_playlist(stdout, 10);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].url, "https://www.youtube.com/watch?v=a1");
        assert_eq!(entries[1].url, "https://soundcloud.com/x/b2");
        assert_eq!(entries[2].title, "Third");
        assert_eq!(parse_flat_playlist(stdout, 1).len(), 1);
    }

    #[test]
    fn video_ids_are_found_in_both_url_forms() {
        assert_eq!(youtube_video_id("https://www.youtube.com/watch?v=abc&t=10"), Some("abc"));
        assert_eq!(youtube_video_id("https://youtu.be/xyz?si=1"), Some("xyz"));
        assert_eq!(youtube_video_id("https://soundcloud.com/a/b"), None);
    }
}
