pub mod autoplay;
pub mod config;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod events;
pub mod models;
pub mod permissions;
pub mod playlists;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod voice;
pub mod ytdlp;
