use std::time::Duration;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::models::{PlaylistEntry, Track};

/// Turns user input into playable tracks.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &str, requester: &str) -> Result<Track, ResolveError>;

    async fn fetch_playlist_entries(&self, url: &str, limit: usize) -> Result<Vec<PlaylistEntry>, ResolveError>;

    /// Tracks similar to `seed`, best match first. May include `seed` itself.
    async fn related(&self, seed: &Track, limit: usize) -> Result<Vec<PlaylistEntry>, ResolveError>;
}

/// Resolution is never retried; a timeout is reported like any other failure.
pub async fn resolve_with_timeout(
    resolver: &dyn Resolver,
    query: &str,
    requester: &str,
    limit: Duration,
) -> Result<Track, ResolveError> {
    match tokio::time::timeout(limit, resolver.resolve(query, requester)).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Timeout(limit)),
    }
}

pub fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

pub fn is_playlist_url(query: &str) -> bool {
    is_url(query) && (query.contains("&list=") || query.contains("?list=") || query.contains("/sets/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_urls_are_detected() {
        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(is_playlist_url("https://www.youtube.com/watch?v=abc&list=PL123"));
        assert!(is_playlist_url("https://soundcloud.com/artist/sets/album"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=abc"));
        assert!(!is_playlist_url("lofi ?list= beats"));
    }
}
