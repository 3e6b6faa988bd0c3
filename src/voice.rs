//! [`Transport`] on top of songbird.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serenity::model::id::GuildId;
use songbird::input::ffmpeg_optioned;
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::events::CompletionSink;
use crate::transport::{StreamRequest, Transport};

const RECONNECT_ARGS: [&str; 6] = ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"];
const OUTPUT_ARGS: [&str; 9] = ["-f", "s16le", "-ac", "2", "-ar", "48000", "-acodec", "pcm_f32le", "-"];

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    tracks: Mutex<HashMap<GuildId, TrackHandle>>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    async fn track(&self, guild_id: GuildId) -> Option<TrackHandle> {
        self.tracks.lock().await.get(&guild_id).cloned()
    }
}

fn input_args(request: &StreamRequest) -> Vec<String> {
    let mut args: Vec<String> = RECONNECT_ARGS.iter().map(|arg| arg.to_string()).collect();

    if !request.offset.is_zero() {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", request.offset.as_secs_f64()));
    }

    if !request.headers.is_empty() {
        let headers: String = request
            .headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect();

        args.push("-headers".to_string());
        args.push(headers);
    }

    args
}

#[async_trait]
impl Transport for SongbirdTransport {
    async fn start_stream(
        &self,
        guild_id: GuildId,
        request: StreamRequest,
        completion: CompletionSink,
    ) -> Result<(), PlayerError> {
        let handler_lock = self.manager.get(guild_id).ok_or(PlayerError::NotConnected)?;

        let pre_args = input_args(&request);
        let pre_args: Vec<&str> = pre_args.iter().map(String::as_str).collect();

        let source = ffmpeg_optioned(&request.stream_url, &pre_args, &OUTPUT_ARGS)
            .await
            .map_err(|why| PlayerError::Transport(why.to_string()))?;

        let track_handle = {
            let mut handler = handler_lock.lock().await;
            handler.play_source(source)
        };

        if let Err(why) = track_handle.set_volume(request.volume) {
            warn!(guild = %guild_id, "Could not set volume: {why}");
        }

        track_handle
            .add_event(Event::Track(TrackEvent::End), StreamEndNotifier { completion })
            .map_err(|why| PlayerError::Transport(why.to_string()))?;

        debug!(guild = %guild_id, offset = ?request.offset, "Stream handed to songbird");
        self.tracks.lock().await.insert(guild_id, track_handle);

        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) {
        if let Some(track_handle) = self.tracks.lock().await.remove(&guild_id) {
            if let Err(why) = track_handle.stop() {
                debug!(guild = %guild_id, "Stop on a finished track: {why}");
            }
        }
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let track_handle = self.track(guild_id).await.ok_or(PlayerError::NothingPlaying)?;

        track_handle.pause().map_err(|why| PlayerError::Transport(why.to_string()))
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let track_handle = self.track(guild_id).await.ok_or(PlayerError::NothingPlaying)?;

        track_handle.play().map_err(|why| PlayerError::Transport(why.to_string()))
    }

    async fn set_volume(&self, guild_id: GuildId, volume: f32) {
        if let Some(track_handle) = self.track(guild_id).await {
            if let Err(why) = track_handle.set_volume(volume) {
                warn!(guild = %guild_id, "Could not set volume: {why}");
            }
        }
    }

    async fn disconnect(&self, guild_id: GuildId) {
        self.tracks.lock().await.remove(&guild_id);

        if self.manager.get(guild_id).is_some() {
            match self.manager.remove(guild_id).await {
                Ok(()) => info!(guild = %guild_id, "Left voice channel"),
                Err(why) => warn!(guild = %guild_id, "Leaving voice failed: {why:?}"),
            }
        }
    }
}

/// Reports the end of one songbird track to the coordinator.
struct StreamEndNotifier {
    completion: CompletionSink,
}

#[async_trait]
impl VoiceEventHandler for StreamEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!(guild = %self.completion.guild_id(), "End notifier triggered");
        self.completion.finished(None);

        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request() -> StreamRequest {
        StreamRequest {
            stream_url: "https://media.example/a".to_string(),
            headers: HashMap::new(),
            offset: Duration::ZERO,
            volume: 0.5,
        }
    }

    #[test]
    fn fresh_streams_only_ask_for_reconnects() {
        assert_eq!(input_args(&request()), RECONNECT_ARGS);
    }

    #[test]
    fn restarts_seek_and_forward_headers() {
        let mut request = request();
        request.offset = Duration::from_millis(100_500);
        request.headers.insert("Referer".to_string(), "https://www.youtube.com".to_string());

        let args = input_args(&request);

        assert_eq!(&args[6..8], ["-ss", "100.500"]);
        assert_eq!(&args[8..], ["-headers", "Referer: https://www.youtube.com\r\n"]);
    }
}
