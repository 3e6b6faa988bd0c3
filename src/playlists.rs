use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serenity::model::id::GuildId;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::PlaylistEntry;

/// Saved playlists, keyed by guild and playlist name.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn get_playlist(&self, guild_id: GuildId, name: &str) -> Result<Option<Vec<PlaylistEntry>>, StoreError>;

    async fn save_playlist(&self, guild_id: GuildId, name: &str, entries: Vec<PlaylistEntry>) -> Result<(), StoreError>;

    /// Appends to the playlist, creating it when needed. Returns the new length.
    async fn append_track(&self, guild_id: GuildId, name: &str, entry: PlaylistEntry) -> Result<usize, StoreError>;

    async fn delete_playlist(&self, guild_id: GuildId, name: &str) -> Result<bool, StoreError>;

    async fn list_playlists(&self, guild_id: GuildId) -> Result<Vec<String>, StoreError>;
}

type Library = BTreeMap<String, BTreeMap<String, Vec<PlaylistEntry>>>;

/// Keeps every playlist in one pretty-printed JSON document, rewritten after each change.
pub struct JsonPlaylistStore {
    path: PathBuf,
    library: Mutex<Library>,
}

impl JsonPlaylistStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let library = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|why| {
                warn!(path = %path.display(), "Playlist file is not valid JSON, starting empty: {why}");
                Library::new()
            }),
            Err(why) if why.kind() == std::io::ErrorKind::NotFound => Library::new(),
            Err(why) => return Err(why.into()),
        };

        info!(path = %path.display(), guilds = library.len(), "Playlists loaded");

        Ok(Self {
            path,
            library: Mutex::new(library),
        })
    }

    async fn persist(&self, library: &Library) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(library)?;
        tokio::fs::write(&self.path, json).await?;

        Ok(())
    }

    /// Applies `change` to a copy of the library and keeps it only once it is on disk.
    async fn update<T>(&self, change: impl FnOnce(&mut Library) -> T) -> Result<T, StoreError> {
        let mut library = self.library.lock().await;
        let mut updated = library.clone();
        let outcome = change(&mut updated);

        self.persist(&updated).await?;
        *library = updated;

        Ok(outcome)
    }
}

fn guild_key(guild_id: GuildId) -> String {
    guild_id.0.to_string()
}

#[async_trait]
impl PlaylistStore for JsonPlaylistStore {
    async fn get_playlist(&self, guild_id: GuildId, name: &str) -> Result<Option<Vec<PlaylistEntry>>, StoreError> {
        let library = self.library.lock().await;

        Ok(library
            .get(&guild_key(guild_id))
            .and_then(|playlists| playlists.get(name))
            .cloned())
    }

    async fn save_playlist(&self, guild_id: GuildId, name: &str, entries: Vec<PlaylistEntry>) -> Result<(), StoreError> {
        self.update(|library| {
            library
                .entry(guild_key(guild_id))
                .or_default()
                .insert(name.to_string(), entries);
        })
        .await
    }

    async fn append_track(&self, guild_id: GuildId, name: &str, entry: PlaylistEntry) -> Result<usize, StoreError> {
        self.update(|library| {
            let playlist = library
                .entry(guild_key(guild_id))
                .or_default()
                .entry(name.to_string())
                .or_default();

            playlist.push(entry);
            playlist.len()
        })
        .await
    }

    async fn delete_playlist(&self, guild_id: GuildId, name: &str) -> Result<bool, StoreError> {
        let exists = {
            let library = self.library.lock().await;
            library
                .get(&guild_key(guild_id))
                .map_or(false, |playlists| playlists.contains_key(name))
        };

        if !exists {
            return Ok(false);
        }

        self.update(|library| {
            library
                .get_mut(&guild_key(guild_id))
                .map_or(false, |playlists| playlists.remove(name).is_some())
        })
        .await
    }

    async fn list_playlists(&self, guild_id: GuildId) -> Result<Vec<String>, StoreError> {
        let library = self.library.lock().await;

        Ok(library
            .get(&guild_key(guild_id))
            .map(|playlists| playlists.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str) -> PlaylistEntry {
        PlaylistEntry {
            title: title.to_string(),
            query: title.to_string(),
            url: format!("https://youtu.be/{title}"),
        }
    }

    #[tokio::test]
    async fn playlists_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("playlists.json");

        let store = JsonPlaylistStore::open(&path).await.unwrap();
        store.save_playlist(GuildId(1), "chill", vec![entry("a")]).await.unwrap();
        assert_eq!(store.append_track(GuildId(1), "chill", entry("b")).await.unwrap(), 2);
        store.append_track(GuildId(1), "party", entry("c")).await.unwrap();
        drop(store);

        let store = JsonPlaylistStore::open(&path).await.unwrap();
        let chill = store.get_playlist(GuildId(1), "chill").await.unwrap().unwrap();
        assert_eq!(chill, vec![entry("a"), entry("b")]);
        assert_eq!(store.list_playlists(GuildId(1)).await.unwrap(), ["chill", "party"]);
    }

    #[tokio::test]
    async fn playlists_are_scoped_per_guild() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPlaylistStore::open(dir.path().join("playlists.json")).await.unwrap();

        store.save_playlist(GuildId(1), "mine", vec![entry("a")]).await.unwrap();

        assert_eq!(store.get_playlist(GuildId(2), "mine").await.unwrap(), None);
        assert!(store.list_playlists(GuildId(2)).await.unwrap().is_empty());
        assert!(!store.delete_playlist(GuildId(2), "mine").await.unwrap());
        assert!(store.delete_playlist(GuildId(1), "mine").await.unwrap());
        assert_eq!(store.get_playlist(GuildId(1), "mine").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_writes_leave_the_library_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlists.json");

        let store = JsonPlaylistStore::open(&path).await.unwrap();
        store.save_playlist(GuildId(1), "kept", vec![entry("a")]).await.unwrap();

        // A directory where the file should be makes every write fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.save_playlist(GuildId(1), "lost", vec![entry("b")]).await.is_err());
        assert!(store.append_track(GuildId(1), "kept", entry("c")).await.is_err());
        assert!(store.delete_playlist(GuildId(1), "kept").await.is_err());

        assert_eq!(store.get_playlist(GuildId(1), "lost").await.unwrap(), None);
        assert_eq!(store.get_playlist(GuildId(1), "kept").await.unwrap(), Some(vec![entry("a")]));
        assert_eq!(store.list_playlists(GuildId(1)).await.unwrap(), ["kept"]);
    }

    #[tokio::test]
    async fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlists.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonPlaylistStore::open(&path).await.unwrap();
        assert!(store.list_playlists(GuildId(1)).await.unwrap().is_empty());
    }
}
