use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::GuildId;

use crate::error::PlayerError;
use crate::events::CompletionSink;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub stream_url: String,
    pub headers: HashMap<String, String>,
    pub offset: Duration,
    pub volume: f32,
}

/// The voice side of a guild: whatever actually pushes audio into the channel.
///
/// Stopping a live stream must deliver exactly one completion through the sink it was started
/// with, just like a stream that reaches its end.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_stream(
        &self,
        guild_id: GuildId,
        request: StreamRequest,
        completion: CompletionSink,
    ) -> Result<(), PlayerError>;

    async fn stop(&self, guild_id: GuildId);

    async fn pause(&self, guild_id: GuildId) -> Result<(), PlayerError>;

    async fn resume(&self, guild_id: GuildId) -> Result<(), PlayerError>;

    async fn set_volume(&self, guild_id: GuildId, volume: f32);

    async fn disconnect(&self, guild_id: GuildId);
}
