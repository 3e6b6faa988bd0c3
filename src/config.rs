use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::permissions::RoleRef;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("could not write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("{path} is not valid: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("invalid setting `{0}`: {1}")]
    Invalid(&'static str, String),

    #[error("Discord token missing. Set DISCORD_TOKEN or fill `discord_token` in the config file.")]
    MissingToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub command_prefix: String,
    pub discord_token: String,
    pub max_queue_length: usize,
    pub default_volume: f32,
    pub allowed_roles: Vec<RoleRef>,
    pub idle_timeout_seconds: u64,
    pub resolve_timeout_seconds: u64,
    pub related_limit: usize,
    pub youtube_cookies_file: Option<PathBuf>,
    pub playlist_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_prefix: "!".to_string(),
            discord_token: String::new(),
            max_queue_length: DEFAULT_QUEUE_CAPACITY,
            default_volume: 0.5,
            allowed_roles: Vec::new(),
            idle_timeout_seconds: 120,
            resolve_timeout_seconds: 20,
            related_limit: 10,
            youtube_cookies_file: None,
            playlist_path: PathBuf::from("data/playlists.json"),
        }
    }
}

impl Config {
    /// Reads the config file. A missing file gives the defaults, a broken one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(why) if why.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        config.validate()?;

        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        std::fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_length == 0 {
            return Err(ConfigError::Invalid("max_queue_length", "must be at least 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.default_volume) {
            return Err(ConfigError::Invalid(
                "default_volume",
                format!("{} is outside 0.0-1.0", self.default_volume),
            ));
        }

        if self.resolve_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("resolve_timeout_seconds", "must be at least 1".to_string()));
        }

        Ok(())
    }

    /// `DISCORD_TOKEN` wins over the file.
    pub fn token(&self) -> Result<String, ConfigError> {
        std::env::var("DISCORD_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .or_else(|| Some(self.discord_token.clone()).filter(|token| !token.is_empty()))
            .ok_or(ConfigError::MissingToken)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::from_json(r#"{ "max_queue_length": 10, "allowed_roles": [1234, "DJ"] }"#).unwrap();

        assert_eq!(config.max_queue_length, 10);
        assert_eq!(config.allowed_roles, [RoleRef::Id(1234), RoleRef::Name("DJ".to_string())]);
        assert_eq!(config.default_volume, 0.5);
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.command_prefix, "!");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let config = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("default_volume", _))));

        let config = Config {
            max_queue_length: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("max_queue_length", _))));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.json")).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn save_round_trips_role_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config {
            allowed_roles: vec![RoleRef::Id(5)],
            ..Config::default()
        };
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap().allowed_roles, [RoleRef::Id(5)]);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
