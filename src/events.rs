use serenity::model::id::GuildId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::models::Track;

/// Work delivered to a guild's actor. Processed strictly in arrival order.
#[derive(Debug)]
pub enum GuildEvent {
    /// The transport reports that `stream` ended, by itself or because it was stopped.
    TrackEnded { stream: u64, error: Option<String> },
    /// The idle-disconnect delay armed at `generation` ran out.
    IdleTimeout { generation: u64 },
}

/// Handed to the transport with every stream it starts, stamped with that stream's id.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    guild_id: GuildId,
    stream: u64,
    events: UnboundedSender<GuildEvent>,
}

impl CompletionSink {
    pub(crate) fn new(guild_id: GuildId, stream: u64, events: UnboundedSender<GuildEvent>) -> Self {
        Self { guild_id, stream, events }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    /// Reports the end of the stream this sink was handed out with.
    pub fn finished(&self, error: Option<String>) {
        let event = GuildEvent::TrackEnded {
            stream: self.stream,
            error,
        };

        if self.events.send(event).is_err() {
            debug!(guild = %self.guild_id, "Completion for a session that is already gone");
        }
    }
}

/// Things the presentation layer may want to tell people about.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStarted { guild_id: GuildId, track: Track },
    QueueFinished { guild_id: GuildId },
    IdleDisconnected { guild_id: GuildId },
    PlaybackFailed { guild_id: GuildId, title: String, reason: String },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlayerEvent::TrackStarted { guild_id, .. }
            | PlayerEvent::QueueFinished { guild_id }
            | PlayerEvent::IdleDisconnected { guild_id }
            | PlayerEvent::PlaybackFailed { guild_id, .. } => *guild_id,
        }
    }
}
