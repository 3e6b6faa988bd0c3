use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            macros::{command, group, hook},
            Args, CommandResult,
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
    Result as SerenityResult,
};
use serenity::client::bridge::gateway::ShardManager;
use serenity::client::Context;
use serenity::framework::standard::CommandError;
use serenity::http::Http;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, RoleId, UserId};
use serenity::model::prelude::{GuildId, VoiceState};
use songbird::{SerenityInit, Songbird};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guild_jukebox::config::{Config, DEFAULT_CONFIG_PATH};
use guild_jukebox::coordinator::{Coordinator, Enqueued, PlaylistImport, Settings, VoteOutcome};
use guild_jukebox::display::{now_playing, parse_timestamp, queue_listing};
use guild_jukebox::error::PlayerError;
use guild_jukebox::events::PlayerEvent;
use guild_jukebox::permissions::{skip_vote_listeners, Actor, ActorRole, RoleRef, VoicePresence};
use guild_jukebox::playlists::JsonPlaylistStore;
use guild_jukebox::resolver::is_playlist_url;
use guild_jukebox::session::SeekDirection;
use guild_jukebox::voice::SongbirdTransport;
use guild_jukebox::ytdlp::YtDlp;

struct Handler;

pub struct PlayerManager;

impl serenity::prelude::TypeMapKey for PlayerManager {
    type Value = Arc<Coordinator>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

/// The config file as loaded, kept around so role changes can be written back.
pub struct ConfigFile {
    pub path: PathBuf,
    pub config: Config,
}

pub struct ConfigManager;

impl serenity::prelude::TypeMapKey for ConfigManager {
    type Value = Arc<Mutex<ConfigFile>>;
}

pub struct ShardManagerContainer;

impl serenity::prelude::TypeMapKey for ShardManagerContainer {
    type Value = Arc<Mutex<ShardManager>>;
}

type AnnounceChannels = Arc<Mutex<HashMap<GuildId, ChannelId>>>;

/// Where player announcements go: the channel of the last command used in the guild.
pub struct AnnounceManager;

impl serenity::prelude::TypeMapKey for AnnounceManager {
    type Value = AnnounceChannels;
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() {
            return;
        }

        let (bot_id, coordinator) = {
            let data = ctx.data.read().await;
            (
                data.get::<BotDataMap>().map(|data| data.id),
                data.get::<PlayerManager>().cloned(),
            )
        };

        if let (Some(bot_id), Some(guild_id), Some(coordinator)) = (bot_id, new.guild_id, coordinator) {
            if bot_id == new.user_id.0 {
                info!(guild = %guild_id, "Bot left voice, closing the session");
                coordinator.teardown(guild_id).await;
            }
        }
    }
}

#[group]
#[commands(
    join, leave, play, search, pause, resume, skip, vskip, stop, clear, queue, np, volume, rewind, forward,
    autoplay, dj, playlist, setroles, shutdown, help
)]
struct General;

#[hook]
async fn before(ctx: &Context, msg: &Message, command_name: &str) -> bool {
    info!(command = command_name, user = %msg.author.name, "Command received");

    if let Some(guild_id) = msg.guild_id {
        let channels = {
            let data = ctx.data.read().await;
            data.get::<AnnounceManager>().cloned()
        };

        if let Some(channels) = channels {
            channels.lock().await.insert(guild_id, msg.channel_id);
        }
    }

    true
}

#[hook]
async fn after(_ctx: &Context, _msg: &Message, command_name: &str, result: CommandResult) {
    if let Err(why) = result {
        warn!(command = command_name, "Command failed: {why:?}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dotenv_loaded = dotenv().is_ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if !dotenv_loaded {
        info!(".env file not found, using the process environment");
    }

    let config_path = PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()));
    let config = Config::load(&config_path)?;
    let token = config.token()?;

    let playlists = JsonPlaylistStore::open(&config.playlist_path).await?;
    let songbird = Songbird::serenity();

    let coordinator = Coordinator::new(
        Settings::from(&config),
        Arc::new(YtDlp::new(config.youtube_cookies_file.clone())),
        Arc::new(SongbirdTransport::new(songbird.clone())),
        Arc::new(playlists),
    );

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.command_prefix.clone()))
        .before(before)
        .after(after)
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(songbird)
        .await?;

    let channels: AnnounceChannels = Arc::new(Mutex::new(HashMap::new()));

    {
        let mut w = client.data.write().await;

        w.insert::<PlayerManager>(coordinator.clone());
        w.insert::<ShardManagerContainer>(client.shard_manager.clone());
        w.insert::<AnnounceManager>(channels.clone());
        w.insert::<ConfigManager>(Arc::new(Mutex::new(ConfigFile {
            path: config_path,
            config,
        })));
    }

    tokio::spawn(announce_events(
        client.cache_and_http.http.clone(),
        channels,
        coordinator.subscribe(),
    ));

    let shard_manager = client.shard_manager.clone();

    // The client also returns once the shutdown command stops every shard.
    tokio::select! {
        result = client.start() => {
            let _ = result.map_err(|why| info!("Client ended: {why:?}"));
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received Ctrl-C, shutting down.");
            shard_manager.lock().await.shutdown_all().await;
        }
    }

    Ok(())
}

async fn announce_events(http: Arc<Http>, channels: AnnounceChannels, mut events: broadcast::Receiver<PlayerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Announcer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let channel_id = match channels.lock().await.get(&event.guild_id()).copied() {
            Some(channel_id) => channel_id,
            None => continue,
        };

        let text = match &event {
            PlayerEvent::TrackStarted { track, .. } => format!(
                "Now playing [{}]({}) · {} · requested by {}",
                track.title, track.url, track.source, track.requester
            ),
            PlayerEvent::QueueFinished { .. } => "Queue finished.".to_string(),
            PlayerEvent::IdleDisconnected { .. } => "Left the voice channel after being idle.".to_string(),
            PlayerEvent::PlaybackFailed { title, reason, .. } => format!("Could not play **{title}**: {reason}"),
        };

        check_msg(channel_id.say(&http, text).await);
    }
}

#[command]
#[only_in(guilds)]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    if join_author_channel(ctx, msg).await? {
        check_msg(msg.channel_id.say(&ctx.http, "Joined your voice channel.").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let manager = get_songbird(ctx).await?;

    if manager.get(guild_id).is_none() {
        check_msg(msg.reply(ctx, "Not in a voice channel").await);
        return Ok(());
    }

    get_coordinator(ctx).await?.leave(guild_id).await;
    check_msg(msg.channel_id.say(&ctx.http, "Left voice channel").await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args.rest().trim(), true).await
}

#[command]
#[only_in(guilds)]
async fn search(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args.rest().trim(), false).await
}

async fn play_with_reaction(ctx: &Context, msg: &Message, query: &str, expand_playlists: bool) -> CommandResult {
    if query.is_empty() {
        check_msg(msg.reply(ctx, "Tell me what to play: a link or some search words.").await);
        return Ok(());
    }

    if !join_author_channel(ctx, msg).await? {
        return Ok(());
    }

    let loading_emoji = Unicode("⏳".to_string());
    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let result = play_query(ctx, msg, query, expand_playlists).await;

    let bot_id = {
        let data = ctx.data.read().await;
        data.get::<BotDataMap>().map(|data| data.id)
    };

    if let Some(bot_id) = bot_id {
        msg.channel_id.delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji).await?;
    }

    let answer_emoji = match &result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    match result {
        Ok(Some(text)) => check_msg(msg.channel_id.say(&ctx.http, text).await),
        Ok(None) => {}
        Err(why) => check_msg(msg.reply(ctx, why.to_string()).await),
    }

    Ok(())
}

async fn play_query(ctx: &Context, msg: &Message, query: &str, expand_playlists: bool) -> Result<Option<String>, PlayerError> {
    let guild_id = msg.guild_id.ok_or(PlayerError::NotConnected)?;
    let coordinator = get_coordinator(ctx).await.map_err(|_| PlayerError::NotConnected)?;
    let requester = msg.author.name.clone();

    if expand_playlists && is_playlist_url(query) {
        info!(guild = %guild_id, query, "Detected playlist");
        let import = coordinator.play_playlist(guild_id, query, &requester).await?;

        return Ok(Some(describe_import(&import)));
    }

    match coordinator.play(guild_id, query, &requester).await? {
        // The announcer posts "Now playing".
        Enqueued::Started(_) => Ok(None),
        Enqueued::Queued { track, position } => Ok(Some(format!("Queued **{}** at position {position}.", track.title))),
    }
}

fn describe_import(import: &PlaylistImport) -> String {
    let mut text = format!("Added {} tracks.", import.added);

    if import.failed > 0 {
        text.push_str(&format!(" {} could not be loaded.", import.failed));
    }

    if import.truncated {
        text.push_str(" The queue is full, the rest was left out.");
    }

    text
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let result = get_coordinator(ctx).await?.pause(guild_id).await;

    respond(ctx, msg, result.map(|_| "Paused.".to_string())).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(unpause)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let result = get_coordinator(ctx).await?.resume(guild_id).await;

    respond(ctx, msg, result.map(|_| "Resumed.".to_string())).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(next)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let result = get_coordinator(ctx).await?.skip(guild_id).await;

    respond(ctx, msg, result.map(|track| format!("Skipped **{}**.", track.title))).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn vskip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let actor = get_actor(ctx, msg).await?;

    let presences = voice_presences(ctx, msg)?;

    let listeners = match skip_vote_listeners(ctx.cache.current_user_id(), msg.author.id, &presences) {
        Ok(listeners) => listeners,
        Err(why) => {
            respond(ctx, msg, Err(why)).await;
            return Ok(());
        }
    };

    let result = get_coordinator(ctx)
        .await?
        .vote_skip(guild_id, &actor, listeners)
        .await
        .map(|outcome| match outcome {
            VoteOutcome::Recorded { votes, required } => format!("Skip vote recorded ({votes}/{required})."),
            VoteOutcome::AlreadyVoted { votes, required } => format!("You already voted ({votes}/{required})."),
            VoteOutcome::Skipped { track, votes, required } => {
                format!("Vote passed ({votes}/{required}), skipped **{}**.", track.title)
            }
            VoteOutcome::UseSkip => "You can skip directly, use `skip`.".to_string(),
        });

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let actor = get_actor(ctx, msg).await?;
    let result = get_coordinator(ctx).await?.stop(guild_id, &actor).await;

    respond(ctx, msg, result.map(|_| "Stopped and cleared the queue.".to_string())).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn clear(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let actor = get_actor(ctx, msg).await?;
    let result = get_coordinator(ctx).await?.clear(guild_id, &actor).await;

    respond(ctx, msg, result.map(|removed| format!("Removed {removed} tracks from the queue."))).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let snapshot = get_coordinator(ctx).await?.snapshot(guild_id).await;

    check_msg(msg.channel_id.say(&ctx.http, queue_listing(&snapshot)).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(nowplaying)]
async fn np(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let snapshot = get_coordinator(ctx).await?.snapshot(guild_id).await;

    check_msg(msg.channel_id.say(&ctx.http, now_playing(&snapshot)).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn volume(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let percent = match args.single::<u32>() {
        Ok(percent) => percent,
        Err(_) => {
            check_msg(msg.reply(ctx, "Give a volume between 0 and 100.").await);
            return Ok(());
        }
    };

    let result = get_coordinator(ctx).await?.set_volume(guild_id, percent).await;

    respond(ctx, msg, result.map(|_| format!("Volume set to {percent}%."))).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn rewind(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    seek(ctx, msg, args, SeekDirection::Rewind).await
}

#[command]
#[only_in(guilds)]
async fn forward(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    seek(ctx, msg, args, SeekDirection::Forward).await
}

async fn seek(ctx: &Context, msg: &Message, args: Args, direction: SeekDirection) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let target = match parse_timestamp(args.rest()) {
        Some(target) => target,
        None => {
            check_msg(msg.reply(ctx, "Use a timestamp like `90`, `1:30` or `1:02:03`.").await);
            return Ok(());
        }
    };

    let result = get_coordinator(ctx).await?.seek(guild_id, target, direction).await;

    respond(
        ctx,
        msg,
        result.map(|target| format!("Jumped to {}.", guild_jukebox::display::clock(&target))),
    )
    .await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn autoplay(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let coordinator = get_coordinator(ctx).await?;

    let mode = args.single::<String>().unwrap_or_default().to_lowercase();
    let playlist = Some(args.rest().trim().to_string()).filter(|name| !name.is_empty());

    let result = match mode.as_str() {
        "on" => coordinator
            .set_autoplay(guild_id, true, playlist.clone())
            .await
            .map(|_| match playlist {
                Some(name) => format!("Autoplay on, continuing from playlist `{name}`."),
                None => "Autoplay on, continuing with related tracks.".to_string(),
            }),
        "off" => coordinator
            .set_autoplay(guild_id, false, None)
            .await
            .map(|_| "Autoplay off.".to_string()),
        _ => {
            check_msg(msg.reply(ctx, "Use `autoplay on [playlist]` or `autoplay off`.").await);
            return Ok(());
        }
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn dj(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let actor = get_actor(ctx, msg).await?;
    let coordinator = get_coordinator(ctx).await?;

    let action = args.single::<String>().unwrap_or_default().to_lowercase();

    let user = match msg.mentions.first() {
        Some(user) => user,
        None => {
            check_msg(msg.reply(ctx, "Use `dj add @member` or `dj remove @member`.").await);
            return Ok(());
        }
    };

    let result = match action.as_str() {
        "add" => coordinator
            .grant_dj(guild_id, &actor, user.id)
            .await
            .map(|_| format!("{} can now control playback until the session ends.", user.name)),
        "remove" => coordinator.revoke_dj(guild_id, &actor, user.id).await.map(|removed| {
            if removed {
                format!("{} is no longer a DJ.", user.name)
            } else {
                format!("{} was not a DJ.", user.name)
            }
        }),
        _ => {
            check_msg(msg.reply(ctx, "Use `dj add @member` or `dj remove @member`.").await);
            return Ok(());
        }
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn playlist(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let coordinator = get_coordinator(ctx).await?;

    let action = args.single::<String>().unwrap_or_default().to_lowercase();
    let name = args.rest().trim().to_string();

    if action != "list" && name.is_empty() {
        check_msg(msg.reply(ctx, "Give the playlist a name.").await);
        return Ok(());
    }

    let result = match action.as_str() {
        "save" => {
            let actor = get_actor(ctx, msg).await?;
            coordinator
                .save_playlist(guild_id, &actor, &name)
                .await
                .map(|count| format!("Saved {count} tracks as `{name}`."))
        }
        "add" => {
            let actor = get_actor(ctx, msg).await?;
            coordinator
                .add_to_playlist(guild_id, &actor, &name)
                .await
                .map(|(track, length)| format!("Added **{}** to `{name}` ({length} tracks).", track.title))
        }
        "delete" => {
            let actor = get_actor(ctx, msg).await?;
            coordinator
                .delete_playlist(guild_id, &actor, &name)
                .await
                .map(|_| format!("Deleted `{name}`."))
        }
        "load" => {
            if !join_author_channel(ctx, msg).await? {
                return Ok(());
            }

            coordinator
                .load_playlist(guild_id, &name, &msg.author.name)
                .await
                .map(|import| describe_import(&import))
        }
        "list" => coordinator.list_playlists(guild_id).await.map(|names| {
            if names.is_empty() {
                "No saved playlists.".to_string()
            } else {
                format!("**Playlists:** {}", names.join(", "))
            }
        }),
        _ => {
            check_msg(msg.reply(ctx, "Use `playlist save|add|load|delete <name>` or `playlist list`.").await);
            return Ok(());
        }
    };

    respond(ctx, msg, result).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn setroles(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let actor = get_actor(ctx, msg).await?;

    let mut roles: Vec<RoleRef> = msg.mention_roles.iter().map(|role| RoleRef::Id(role.0)).collect();
    roles.extend(
        args.raw()
            .filter(|arg| !arg.starts_with("<@&"))
            .map(|arg| match arg.parse::<u64>() {
                Ok(id) => RoleRef::Id(id),
                Err(_) => RoleRef::Name(arg.to_string()),
            }),
    );

    if let Err(why) = get_coordinator(ctx).await?.set_allowed_roles(&actor, roles.clone()) {
        check_msg(msg.reply(ctx, why.to_string()).await);
        return Ok(());
    }

    let config = {
        let data = ctx.data.read().await;
        data.get::<ConfigManager>().cloned()
    };

    if let Some(config) = config {
        let mut config = config.lock().await;
        config.config.allowed_roles = roles.clone();

        if let Err(why) = config.config.save(&config.path) {
            warn!("Could not persist allowed roles: {why}");
            check_msg(msg.reply(ctx, "Roles updated, but saving the config failed.").await);
            return Ok(());
        }
    }

    let text = if roles.is_empty() {
        "Everyone can control playback now.".to_string()
    } else {
        let names: Vec<String> = roles.iter().map(ToString::to_string).collect();
        format!("Playback control limited to: {}", names.join(", "))
    };

    check_msg(msg.channel_id.say(&ctx.http, text).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shutdown(ctx: &Context, msg: &Message) -> CommandResult {
    let actor = get_actor(ctx, msg).await?;

    if !actor.administrator {
        respond(ctx, msg, Err(PlayerError::PermissionDenied)).await;
        return Ok(());
    }

    let (coordinator, shard_manager) = {
        let data = ctx.data.read().await;
        (
            data.get::<PlayerManager>().cloned(),
            data.get::<ShardManagerContainer>().cloned(),
        )
    };

    let shard_manager = match shard_manager {
        Some(shard_manager) => shard_manager,
        None => {
            check_msg(msg.reply(ctx, "There was a problem getting the shard manager").await);
            return Ok(());
        }
    };

    info!(user = %msg.author.name, "Shutdown requested");
    check_msg(msg.channel_id.say(&ctx.http, "Shutting down.").await);

    if let Some(coordinator) = coordinator {
        coordinator.leave_all().await;
    }

    shard_manager.lock().await.shutdown_all().await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **join** / **leave** - Joins your voice channel / leaves it and forgets the queue.
    **play [URL|Title]** - Plays (or adds to the queue) a track given a URL or a title (supports playlists).
    **search [Title]** - Searches YouTube and queues the best match.
    **pause** / **resume** - Pauses or resumes the current track.
    **skip** - Plays the next track.
    **vskip** - Votes to skip; half of the listeners are needed.
    **stop** - Stops playback and clears the queue.
    **clear** - Clears the queue.
    **queue** / **np** - Shows the queue / the current track.
    **volume [0-100]** - Sets the volume.
    **rewind [TIME]** / **forward [TIME]** - Jumps to a timestamp like `1:30`.
    **autoplay on [PLAYLIST]** / **autoplay off** - Keeps the music going when the queue runs out.
    **dj add|remove @member** - Grants or revokes temporary playback control.
    **playlist save|add|load|delete [NAME]** / **playlist list** - Manages saved playlists.
    **setroles [ROLES...]** - Sets the roles allowed to control playback (administrators only).
    **shutdown** - Leaves every voice channel and stops the bot (administrators only).
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn respond(ctx: &Context, msg: &Message, result: Result<String, PlayerError>) {
    match result {
        Ok(text) => check_msg(msg.channel_id.say(&ctx.http, text).await),
        Err(why) => {
            info!(user = %msg.author.name, "Command refused: {why}");
            check_msg(msg.reply(ctx, why.to_string()).await);
        }
    }
}

/// Makes sure the bot sits in a voice channel, joining the author's when it isn't.
async fn join_author_channel(ctx: &Context, msg: &Message) -> CommandResult<bool> {
    let guild = get_guild(ctx, msg)?;
    let manager = get_songbird(ctx).await?;

    if manager.get(guild.id).is_some() {
        return Ok(true);
    }

    let connect_to = match guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
    {
        Some(channel) => channel,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);
            return Ok(false);
        }
    };

    let (handler_lock, result) = manager.join(guild.id, connect_to).await;

    if let Err(why) = result {
        check_msg(msg.reply(ctx, format!("Could not join: {why:?}")).await);
        return Ok(false);
    }

    let mut handler = handler_lock.lock().await;

    if !handler.is_deaf() {
        if let Err(e) = handler.deafen(true).await {
            info!("Deafen failed due to {e:?}")
        }
    }

    info!(guild = %guild.id, channel = %connect_to, "Joined voice");

    Ok(true)
}

fn voice_presences(ctx: &Context, msg: &Message) -> CommandResult<Vec<VoicePresence>> {
    let guild = get_guild(ctx, msg)?;

    Ok(guild
        .voice_states
        .values()
        .map(|state| VoicePresence {
            user: state.user_id,
            channel: state.channel_id,
            bot: state.member.as_ref().map_or(false, |member| member.user.bot),
        })
        .collect())
}

async fn get_actor(ctx: &Context, msg: &Message) -> CommandResult<Actor> {
    let guild = get_guild(ctx, msg)?;
    let member = msg.member(ctx).await?;

    let roles = member
        .roles
        .iter()
        .map(|id: &RoleId| ActorRole {
            id: *id,
            name: guild.roles.get(id).map(|role| role.name.clone()).unwrap_or_default(),
        })
        .collect();

    Ok(Actor {
        id: msg.author.id,
        administrator: guild.owner_id == msg.author.id || guild.member_permissions(ctx, member.user.id).await?.administrator(),
        roles,
    })
}

async fn get_coordinator(ctx: &Context) -> CommandResult<Arc<Coordinator>> {
    let data = ctx.data.read().await;

    data.get::<PlayerManager>()
        .cloned()
        .ok_or_else(|| CommandError::from("Player not initialised"))
}

async fn get_songbird(ctx: &Context) -> CommandResult<Arc<Songbird>> {
    songbird::get(ctx)
        .await
        .ok_or_else(|| CommandError::from("Songbird Voice client not initialised"))
}

/// Checks that a message successfully sent; if not, then logs why.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}
