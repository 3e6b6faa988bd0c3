//! Picks what plays when the queue runs dry.
//!
//! With a linked playlist the selector walks it circularly from the session's cursor. Without
//! one it asks the resolver for tracks related to the most recent one and drops anything heard
//! in the last [`REPEAT_WINDOW`] tracks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use serenity::model::id::GuildId;
use tracing::{debug, info, warn};

use crate::models::{PlaylistEntry, Track};
use crate::playlists::PlaylistStore;
use crate::resolver::{resolve_with_timeout, Resolver};

/// How many of the latest played tracks are never picked again.
pub const REPEAT_WINDOW: usize = 15;
pub const AUTOPLAY_REQUESTER: &str = "Autoplay";
const DEFAULT_VARIETY: usize = 3;

/// Builds a plain search out of a track when no related tracks are known.
pub trait FallbackQuery: Send + Sync {
    fn query_for(&self, seed: &Track) -> Option<String>;
}

/// Searches for the seed's title without bracketed noise like "(Official Video)".
#[derive(Debug, Default, Clone, Copy)]
pub struct TitleSearch;

impl FallbackQuery for TitleSearch {
    fn query_for(&self, seed: &Track) -> Option<String> {
        let mut cleaned = String::with_capacity(seed.title.len());
        let mut depth = 0usize;

        for c in seed.title.chars() {
            match c {
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                _ if depth == 0 => cleaned.push(c),
                _ => {}
            }
        }

        let cleaned = cleaned.split(" | ").next().unwrap_or_default();
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoplayRequest {
    pub guild_id: GuildId,
    pub playlist: Option<String>,
    pub cursor: usize,
    /// Recently played tracks, oldest first; the last one seeds related lookups.
    pub recent: Vec<Track>,
}

#[derive(Debug, Clone)]
pub struct AutoplayPick {
    pub track: Option<Track>,
    pub cursor: usize,
}

pub struct AutoplaySelector {
    resolver: Arc<dyn Resolver>,
    playlists: Arc<dyn PlaylistStore>,
    fallback: Box<dyn FallbackQuery>,
    related_limit: usize,
    resolve_timeout: Duration,
    variety: usize,
}

impl AutoplaySelector {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        playlists: Arc<dyn PlaylistStore>,
        related_limit: usize,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            playlists,
            fallback: Box::new(TitleSearch),
            related_limit,
            resolve_timeout,
            variety: DEFAULT_VARIETY,
        }
    }

    pub fn with_fallback(mut self, fallback: impl FallbackQuery + 'static) -> Self {
        self.fallback = Box::new(fallback);
        self
    }

    /// How many of the best related candidates get shuffled before trying them. 0 or 1 keeps the
    /// resolver's order.
    pub fn with_variety(mut self, variety: usize) -> Self {
        self.variety = variety;
        self
    }

    pub async fn select(&self, request: &AutoplayRequest) -> AutoplayPick {
        match &request.playlist {
            Some(name) => self.from_playlist(request.guild_id, name, request.cursor).await,
            None => AutoplayPick {
                track: self.from_related(&request.recent).await,
                cursor: request.cursor,
            },
        }
    }

    async fn from_playlist(&self, guild_id: GuildId, name: &str, cursor: usize) -> AutoplayPick {
        let entries = match self.playlists.get_playlist(guild_id, name).await {
            Ok(Some(entries)) if !entries.is_empty() => entries,
            Ok(_) => {
                warn!(guild = %guild_id, playlist = name, "Autoplay playlist is missing or empty");
                return AutoplayPick { track: None, cursor };
            }
            Err(why) => {
                warn!(guild = %guild_id, playlist = name, "Could not read autoplay playlist: {why}");
                return AutoplayPick { track: None, cursor };
            }
        };

        let start = cursor % entries.len();
        let mut next = start;

        for step in 0..entries.len() {
            let index = (start + step) % entries.len();
            let entry = &entries[index];
            next = (index + 1) % entries.len();

            match self.resolve(entry.lookup()).await {
                Ok(track) => {
                    info!(guild = %guild_id, playlist = name, index, title = %track.title, "Autoplay picked playlist entry");
                    return AutoplayPick { track: Some(track), cursor: next };
                }
                Err(why) => warn!(guild = %guild_id, playlist = name, index, "Skipping autoplay entry {}: {why}", entry.title),
            }
        }

        AutoplayPick { track: None, cursor: next }
    }

    async fn from_related(&self, recent: &[Track]) -> Option<Track> {
        let seed = recent.last()?;
        let played: HashSet<&str> = recent
            .iter()
            .rev()
            .take(REPEAT_WINDOW)
            .map(|track| track.url.as_str())
            .collect();

        let related = match tokio::time::timeout(self.resolve_timeout, self.resolver.related(seed, self.related_limit)).await {
            Ok(Ok(related)) => related,
            Ok(Err(why)) => {
                warn!(seed = %seed.title, "Related lookup failed: {why}");
                Vec::new()
            }
            Err(_) => {
                warn!(seed = %seed.title, "Related lookup timed out");
                Vec::new()
            }
        };

        if related.is_empty() {
            return self.from_fallback(seed, &played).await;
        }

        let mut candidates: Vec<PlaylistEntry> = related
            .into_iter()
            .filter(|entry| !played.contains(entry.url.as_str()))
            .collect();

        debug!(seed = %seed.title, candidates = candidates.len(), "Related candidates after repeat filter");

        {
            let head = candidates.len().min(self.variety);
            candidates[..head].shuffle(&mut thread_rng());
        }

        for candidate in candidates {
            match self.resolve(candidate.lookup()).await {
                Ok(track) if played.contains(track.url.as_str()) => {
                    debug!(title = %track.title, "Related candidate resolved to a recent track");
                }
                Ok(track) => return Some(track),
                Err(why) => warn!("Related candidate {} failed: {why}", candidate.title),
            }
        }

        None
    }

    async fn from_fallback(&self, seed: &Track, played: &HashSet<&str>) -> Option<Track> {
        let query = self.fallback.query_for(seed)?;
        info!(seed = %seed.title, query = %query, "No related tracks, searching instead");

        match self.resolve(&query).await {
            Ok(track) if !played.contains(track.url.as_str()) => Some(track),
            Ok(_) => None,
            Err(why) => {
                warn!(query = %query, "Fallback search failed: {why}");
                None
            }
        }
    }

    async fn resolve(&self, query: &str) -> Result<Track, crate::error::ResolveError> {
        resolve_with_timeout(self.resolver.as_ref(), query, AUTOPLAY_REQUESTER, self.resolve_timeout).await
    }
}
