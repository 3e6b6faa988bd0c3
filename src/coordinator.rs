//! The playback coordinator.
//!
//! Every guild gets one [`GuildSession`]: its queue and session state behind a single async
//! mutex, plus an ordered event channel drained by a per-guild actor task. User commands lock the
//! session directly; transport completions and idle timeouts arrive as events and are applied by
//! the actor under the same lock, so track starts for one guild never overlap. Guilds never share
//! a lock with each other, the registry map is only locked to look a session up.
//!
//! Network work (resolving tracks, choosing an autoplay continuation) always happens with the
//! guild lock released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard as SyncMutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serenity::model::id::{GuildId, UserId};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::autoplay::{AutoplayRequest, AutoplaySelector, REPEAT_WINDOW};
use crate::config::Config;
use crate::error::PlayerError;
use crate::events::{CompletionSink, GuildEvent, PlayerEvent};
use crate::models::{PlaylistEntry, Track};
use crate::permissions::{is_authorized, Actor, RoleRef};
use crate::playlists::PlaylistStore;
use crate::resolver::{resolve_with_timeout, Resolver};
use crate::session::{vote_threshold, Completion, Phase, SeekDirection, SessionState};
use crate::transport::{StreamRequest, Transport};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct Settings {
    pub max_queue_length: usize,
    pub default_volume: f32,
    pub allowed_roles: Vec<RoleRef>,
    pub idle_timeout: Duration,
    pub resolve_timeout: Duration,
    pub related_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from(&Config::default())
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            max_queue_length: config.max_queue_length.max(1),
            default_volume: config.default_volume,
            allowed_roles: config.allowed_roles.clone(),
            idle_timeout: config.idle_timeout(),
            resolve_timeout: config.resolve_timeout(),
            related_limit: config.related_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Started(Track),
    Queued { track: Track, position: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistImport {
    pub added: usize,
    pub failed: usize,
    /// The queue filled up before every entry was added.
    pub truncated: bool,
    pub started: Option<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Recorded { votes: usize, required: usize },
    AlreadyVoted { votes: usize, required: usize },
    Skipped { track: Track, votes: usize, required: usize },
    /// Privileged members skip directly instead of voting.
    UseSkip,
}

/// Read-only projection of a guild session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub current: Option<Track>,
    pub elapsed: Duration,
    pub phase: Phase,
    pub paused: bool,
    pub volume: f32,
    pub queue: Vec<Track>,
    pub capacity: usize,
    pub autoplay: bool,
    pub autoplay_playlist: Option<String>,
    pub history: Vec<Track>,
    pub temporary_djs: Vec<UserId>,
    pub idle_disconnect_pending: bool,
    pub playback_generation: u64,
}

pub(crate) struct GuildSession {
    guild_id: GuildId,
    state: Mutex<SessionState>,
    events: UnboundedSender<GuildEvent>,
}

/// What is left to do after the queue advanced with the lock held.
enum Advance {
    Started,
    Idle,
    Autoplay { request: AutoplayRequest, token: u64 },
}

pub struct Coordinator {
    settings: Settings,
    allowed_roles: RwLock<Vec<RoleRef>>,
    resolver: Arc<dyn Resolver>,
    transport: Arc<dyn Transport>,
    playlists: Arc<dyn PlaylistStore>,
    autoplay: AutoplaySelector,
    sessions: SyncMutex<HashMap<GuildId, Arc<GuildSession>>>,
    events: broadcast::Sender<PlayerEvent>,
    this: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn Transport>,
        playlists: Arc<dyn PlaylistStore>,
    ) -> Arc<Self> {
        let autoplay = AutoplaySelector::new(
            resolver.clone(),
            playlists.clone(),
            settings.related_limit,
            settings.resolve_timeout,
        );

        Self::with_selector(settings, resolver, transport, playlists, autoplay)
    }

    pub fn with_selector(
        settings: Settings,
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn Transport>,
        playlists: Arc<dyn PlaylistStore>,
        autoplay: AutoplaySelector,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Arc::new_cyclic(|this| Self {
            allowed_roles: RwLock::new(settings.allowed_roles.clone()),
            settings,
            resolver,
            transport,
            playlists,
            autoplay,
            sessions: SyncMutex::new(HashMap::new()),
            events,
            this: this.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn allowed_roles(&self) -> Vec<RoleRef> {
        self.allowed_roles.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the role allow-list. Administrators only.
    pub fn set_allowed_roles(&self, actor: &Actor, roles: Vec<RoleRef>) -> Result<(), PlayerError> {
        if !actor.administrator {
            return Err(PlayerError::PermissionDenied);
        }

        info!(roles = ?roles, "Allowed roles updated");
        *self.allowed_roles.write().unwrap_or_else(PoisonError::into_inner) = roles;

        Ok(())
    }

    pub async fn is_authorized(&self, guild_id: GuildId, actor: &Actor) -> bool {
        match self.existing(guild_id) {
            Some(session) => {
                let state = session.state.lock().await;
                self.authorized(actor, &state)
            }
            None => is_authorized(actor, &self.allowed_roles(), &Default::default()),
        }
    }

    // ---- queueing -------------------------------------------------------------------------

    /// Resolves `query` and queues the result, starting it right away when nothing is playing.
    pub async fn play(&self, guild_id: GuildId, query: &str, requester: &str) -> Result<Enqueued, PlayerError> {
        let query = query.trim();
        info!(guild = %guild_id, query, requester, "Play requested");

        let track = resolve_with_timeout(self.resolver.as_ref(), query, requester, self.settings.resolve_timeout).await?;

        self.enqueue(guild_id, track).await
    }

    pub async fn enqueue(&self, guild_id: GuildId, track: Track) -> Result<Enqueued, PlayerError> {
        let session = self.session(guild_id);
        let mut state = session.state.lock().await;

        let capacity = state.queue.capacity();
        let position = state
            .queue
            .enqueue(track.clone())
            .map_err(|_| PlayerError::QueueFull { capacity })?;

        if state.phase() != Phase::Idle {
            info!(guild = %guild_id, title = %track.title, position, "Track queued");
            return Ok(Enqueued::Queued { track, position });
        }

        match state.queue.dequeue_front() {
            Some(next) => {
                self.start_track(&session, &mut state, next.clone(), Duration::ZERO, true).await?;
                Ok(Enqueued::Started(next))
            }
            None => Ok(Enqueued::Queued { track, position }),
        }
    }

    /// Expands a playlist URL and queues as many entries as fit.
    pub async fn play_playlist(&self, guild_id: GuildId, url: &str, requester: &str) -> Result<PlaylistImport, PlayerError> {
        let remaining = {
            let session = self.session(guild_id);
            let state = session.state.lock().await;
            state.queue.remaining() + usize::from(state.phase() == Phase::Idle)
        };

        if remaining == 0 {
            return Err(PlayerError::QueueFull {
                capacity: self.settings.max_queue_length,
            });
        }

        let entries = match tokio::time::timeout(
            self.settings.resolve_timeout,
            self.resolver.fetch_playlist_entries(url, remaining),
        )
        .await
        {
            Ok(entries) => entries?,
            Err(_) => return Err(crate::error::ResolveError::Timeout(self.settings.resolve_timeout).into()),
        };

        info!(guild = %guild_id, url, entries = entries.len(), "Playlist expanded");

        self.enqueue_entries(guild_id, &entries, requester).await
    }

    async fn enqueue_entries(
        &self,
        guild_id: GuildId,
        entries: &[PlaylistEntry],
        requester: &str,
    ) -> Result<PlaylistImport, PlayerError> {
        let mut import = PlaylistImport::default();

        for entry in entries {
            let track = match resolve_with_timeout(
                self.resolver.as_ref(),
                entry.lookup(),
                requester,
                self.settings.resolve_timeout,
            )
            .await
            {
                Ok(track) => track,
                Err(why) => {
                    warn!(guild = %guild_id, entry = %entry.title, "Skipping playlist entry: {why}");
                    import.failed += 1;
                    continue;
                }
            };

            match self.enqueue(guild_id, track).await {
                Ok(Enqueued::Started(track)) => {
                    import.added += 1;
                    import.started = Some(track);
                }
                Ok(Enqueued::Queued { .. }) => import.added += 1,
                Err(PlayerError::QueueFull { .. }) => {
                    import.truncated = true;
                    break;
                }
                Err(why) => {
                    warn!(guild = %guild_id, entry = %entry.title, "Could not queue playlist entry: {why}");
                    import.failed += 1;
                }
            }
        }

        Ok(import)
    }

    pub async fn clear(&self, guild_id: GuildId, actor: &Actor) -> Result<usize, PlayerError> {
        let session = match self.existing(guild_id) {
            Some(session) => session,
            None => {
                if !self.is_authorized(guild_id, actor).await {
                    return Err(PlayerError::PermissionDenied);
                }
                return Ok(0);
            }
        };
        let mut state = session.state.lock().await;
        self.authorize(actor, &state)?;

        let removed = state.queue.clear();
        info!(guild = %guild_id, removed, "Queue cleared");

        Ok(removed)
    }

    // ---- playback control -----------------------------------------------------------------

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NothingPlaying)?;
        let mut state = session.state.lock().await;

        if state.phase() != Phase::Playing {
            return Err(PlayerError::NothingPlaying);
        }

        self.transport.pause(guild_id).await?;
        state.pause(Instant::now())?;
        info!(guild = %guild_id, "Paused");

        Ok(())
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NotPaused)?;
        let mut state = session.state.lock().await;

        if state.phase() != Phase::Paused {
            return Err(PlayerError::NotPaused);
        }

        self.transport.resume(guild_id).await?;
        state.resume(Instant::now())?;
        info!(guild = %guild_id, "Resumed");

        Ok(())
    }

    /// Skips the live track and returns it.
    pub async fn skip(&self, guild_id: GuildId) -> Result<Track, PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NothingPlaying)?;
        let state = session.state.lock().await;

        self.skip_locked(&session, state).await
    }

    pub async fn vote_skip(&self, guild_id: GuildId, actor: &Actor, listeners: usize) -> Result<VoteOutcome, PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NothingPlaying)?;
        let mut state = session.state.lock().await;

        if !state.is_active() {
            return Err(PlayerError::NothingPlaying);
        }

        if self.authorized(actor, &state) {
            return Ok(VoteOutcome::UseSkip);
        }

        let required = vote_threshold(listeners);

        if !state.cast_ballot(actor.id) {
            return Ok(VoteOutcome::AlreadyVoted {
                votes: state.ballots(),
                required,
            });
        }

        let votes = state.ballots();
        info!(guild = %guild_id, voter = %actor.id, votes, required, "Skip vote");

        if votes < required {
            return Ok(VoteOutcome::Recorded { votes, required });
        }

        let track = self.skip_locked(&session, state).await?;

        Ok(VoteOutcome::Skipped { track, votes, required })
    }

    /// Clears the queue and stops playback. The bot stays connected until the idle timer fires.
    pub async fn stop(&self, guild_id: GuildId, actor: &Actor) -> Result<(), PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NotConnected)?;
        let mut state = session.state.lock().await;
        self.authorize(actor, &state)?;

        let removed = state.queue.clear();

        if state.is_active() {
            state.suppress_next_completion();
            self.transport.stop(guild_id).await;
        }

        self.go_idle(&session, &mut state);
        info!(guild = %guild_id, removed, "Playback stopped");

        Ok(())
    }

    /// Restarts the live track at `target`. Rewinds must go back, fast-forwards must go ahead.
    pub async fn seek(&self, guild_id: GuildId, target: Duration, direction: SeekDirection) -> Result<Duration, PlayerError> {
        let session = self.existing(guild_id).ok_or(PlayerError::NothingPlaying)?;
        let mut state = session.state.lock().await;

        let track = state.validate_seek(target, direction, Instant::now())?;

        state.suppress_next_completion();
        self.transport.stop(guild_id).await;

        match self.start_track(&session, &mut state, track, target, false).await {
            Ok(()) => {
                info!(guild = %guild_id, target = ?target, ?direction, "Seeked");
                Ok(target)
            }
            Err(why) => {
                warn!(guild = %guild_id, "Restart after seek failed: {why}");
                let step = self.advance(&session, &mut state).await;
                drop(state);
                self.follow_up(&session, step).await;
                Err(why)
            }
        }
    }

    /// Sets the volume in percent for the live stream and for everything played afterwards.
    pub async fn set_volume(&self, guild_id: GuildId, percent: u32) -> Result<f32, PlayerError> {
        if percent > 100 {
            return Err(PlayerError::InvalidVolume(percent));
        }

        let volume = percent as f32 / 100.0;
        let session = self.session(guild_id);
        let mut state = session.state.lock().await;

        state.set_volume(volume);

        if state.is_active() {
            self.transport.set_volume(guild_id, volume).await;
        }

        info!(guild = %guild_id, volume, "Volume set");

        Ok(volume)
    }

    /// Turns autoplay on or off. With a playlist name, continuations come from that playlist.
    pub async fn set_autoplay(&self, guild_id: GuildId, enabled: bool, playlist: Option<String>) -> Result<(), PlayerError> {
        if let Some(name) = &playlist {
            if self.playlists.get_playlist(guild_id, name).await?.is_none() {
                return Err(PlayerError::PlaylistNotFound(name.clone()));
            }
        }

        let session = self.session(guild_id);
        let mut state = session.state.lock().await;
        info!(guild = %guild_id, enabled, playlist = ?playlist, "Autoplay configured");
        state.set_autoplay(enabled, playlist);

        Ok(())
    }

    pub async fn grant_dj(&self, guild_id: GuildId, actor: &Actor, user: UserId) -> Result<bool, PlayerError> {
        let session = self.session(guild_id);
        let mut state = session.state.lock().await;
        self.authorize(actor, &state)?;

        info!(guild = %guild_id, granted_by = %actor.id, user = %user, "Temporary DJ granted");

        Ok(state.grant_dj(user))
    }

    pub async fn revoke_dj(&self, guild_id: GuildId, actor: &Actor, user: UserId) -> Result<bool, PlayerError> {
        let session = self.session(guild_id);
        let mut state = session.state.lock().await;
        self.authorize(actor, &state)?;

        info!(guild = %guild_id, revoked_by = %actor.id, user = %user, "Temporary DJ revoked");

        Ok(state.revoke_dj(user))
    }

    // ---- saved playlists ------------------------------------------------------------------

    /// Stores the current track and the queue under `name`.
    pub async fn save_playlist(&self, guild_id: GuildId, actor: &Actor, name: &str) -> Result<usize, PlayerError> {
        let entries: Vec<PlaylistEntry> = {
            let session = self.session(guild_id);
            let state = session.state.lock().await;
            self.authorize(actor, &state)?;

            let queued = state.queue.snapshot();
            let entries = state
                .current()
                .into_iter()
                .chain(queued.iter())
                .map(PlaylistEntry::from)
                .collect();

            entries
        };

        if entries.is_empty() {
            return Err(PlayerError::NothingPlaying);
        }

        let count = entries.len();
        self.playlists.save_playlist(guild_id, name, entries).await?;
        info!(guild = %guild_id, playlist = name, count, "Playlist saved");

        Ok(count)
    }

    /// Appends the current track to `name`, creating the playlist when needed.
    pub async fn add_to_playlist(&self, guild_id: GuildId, actor: &Actor, name: &str) -> Result<(Track, usize), PlayerError> {
        let current = {
            let session = self.session(guild_id);
            let state = session.state.lock().await;
            self.authorize(actor, &state)?;
            state.current().cloned().ok_or(PlayerError::NothingPlaying)?
        };

        let length = self
            .playlists
            .append_track(guild_id, name, PlaylistEntry::from(&current))
            .await?;

        Ok((current, length))
    }

    pub async fn delete_playlist(&self, guild_id: GuildId, actor: &Actor, name: &str) -> Result<(), PlayerError> {
        {
            let session = self.session(guild_id);
            let state = session.state.lock().await;
            self.authorize(actor, &state)?;
        }

        if self.playlists.delete_playlist(guild_id, name).await? {
            info!(guild = %guild_id, playlist = name, "Playlist deleted");
            Ok(())
        } else {
            Err(PlayerError::PlaylistNotFound(name.to_string()))
        }
    }

    pub async fn list_playlists(&self, guild_id: GuildId) -> Result<Vec<String>, PlayerError> {
        Ok(self.playlists.list_playlists(guild_id).await?)
    }

    pub async fn load_playlist(&self, guild_id: GuildId, name: &str, requester: &str) -> Result<PlaylistImport, PlayerError> {
        let entries = self
            .playlists
            .get_playlist(guild_id, name)
            .await?
            .ok_or_else(|| PlayerError::PlaylistNotFound(name.to_string()))?;

        self.enqueue_entries(guild_id, &entries, requester).await
    }

    // ---- session lifecycle ----------------------------------------------------------------

    pub async fn snapshot(&self, guild_id: GuildId) -> PlayerSnapshot {
        let session = match self.existing(guild_id) {
            Some(session) => session,
            None => {
                return PlayerSnapshot {
                    current: None,
                    elapsed: Duration::ZERO,
                    phase: Phase::Idle,
                    paused: false,
                    volume: self.settings.default_volume,
                    queue: Vec::new(),
                    capacity: self.settings.max_queue_length,
                    autoplay: false,
                    autoplay_playlist: None,
                    history: Vec::new(),
                    temporary_djs: Vec::new(),
                    idle_disconnect_pending: false,
                    playback_generation: 0,
                }
            }
        };

        let state = session.state.lock().await;

        PlayerSnapshot {
            current: state.current().cloned(),
            elapsed: state.elapsed(Instant::now()),
            phase: state.phase(),
            paused: state.phase() == Phase::Paused,
            volume: state.volume(),
            queue: state.queue.snapshot(),
            capacity: state.queue.capacity(),
            autoplay: state.autoplay.enabled,
            autoplay_playlist: state.autoplay.playlist.clone(),
            history: state.history().recent(REPEAT_WINDOW).cloned().collect(),
            temporary_djs: state.temporary_djs().iter().copied().collect(),
            idle_disconnect_pending: state.idle_timer_armed(),
            playback_generation: state.generation(),
        }
    }

    /// Drops everything known about the guild. Used once the bot is out of the voice channel.
    pub async fn teardown(&self, guild_id: GuildId) {
        let session = match self.registry().remove(&guild_id) {
            Some(session) => session,
            None => return,
        };

        let mut state = session.state.lock().await;
        state.queue.clear();

        if state.is_active() {
            state.suppress_next_completion();
            self.transport.stop(guild_id).await;
        }

        state.enter_idle();
        state.cancel_idle_timer();

        info!(guild = %guild_id, "Session closed");
    }

    /// Leaves the voice channel and closes the session.
    pub async fn leave(&self, guild_id: GuildId) {
        self.teardown(guild_id).await;
        self.transport.disconnect(guild_id).await;
    }

    /// Leaves every guild the bot is playing in. Used before the client shuts down.
    pub async fn leave_all(&self) {
        let guilds: Vec<GuildId> = self.registry().keys().copied().collect();
        info!(sessions = guilds.len(), "Leaving every voice channel");

        for guild_id in guilds {
            self.leave(guild_id).await;
        }
    }

    /// Pushes an event into the guild's actor queue, as the transport and timers do.
    pub fn deliver(&self, guild_id: GuildId, event: GuildEvent) -> bool {
        match self.existing(guild_id) {
            Some(session) => session.events.send(event).is_ok(),
            None => false,
        }
    }

    // ---- internals ------------------------------------------------------------------------

    fn registry(&self) -> SyncMutexGuard<'_, HashMap<GuildId, Arc<GuildSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn existing(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.registry().get(&guild_id).cloned()
    }

    fn is_registered(&self, session: &Arc<GuildSession>) -> bool {
        self.registry()
            .get(&session.guild_id)
            .map_or(false, |registered| Arc::ptr_eq(registered, session))
    }

    fn session(&self, guild_id: GuildId) -> Arc<GuildSession> {
        self.registry()
            .entry(guild_id)
            .or_insert_with(|| self.open_session(guild_id))
            .clone()
    }

    /// A new session starts out idle, so it is closed again if nothing gets played.
    fn open_session(&self, guild_id: GuildId) -> Arc<GuildSession> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = SessionState::new(self.settings.max_queue_length.max(1), self.settings.default_volume);
        let generation = state.enter_idle();
        state.arm_idle_timer(tokio::spawn(idle_timer(
            sender.clone(),
            self.settings.idle_timeout,
            generation,
        )));

        let session = Arc::new(GuildSession {
            guild_id,
            state: Mutex::new(state),
            events: sender,
        });

        tokio::spawn(
            run_session_actor(self.this.clone(), Arc::downgrade(&session), receiver)
                .instrument(info_span!("guild", guild = %guild_id)),
        );

        info!(guild = %guild_id, "Session opened");

        session
    }

    fn authorized(&self, actor: &Actor, state: &SessionState) -> bool {
        is_authorized(actor, &self.allowed_roles(), state.temporary_djs())
    }

    fn authorize(&self, actor: &Actor, state: &SessionState) -> Result<(), PlayerError> {
        if self.authorized(actor, state) {
            Ok(())
        } else {
            info!(actor = %actor.id, "Permission denied");
            Err(PlayerError::PermissionDenied)
        }
    }

    fn emit(&self, event: PlayerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn start_track(
        &self,
        session: &GuildSession,
        state: &mut SessionState,
        track: Track,
        offset: Duration,
        fresh: bool,
    ) -> Result<(), PlayerError> {
        let request = StreamRequest {
            stream_url: track.stream_url.clone(),
            headers: track.headers.clone(),
            offset,
            volume: state.volume(),
        };
        let stream = state.next_stream();
        let completion = CompletionSink::new(session.guild_id, stream, session.events.clone());

        self.transport.start_stream(session.guild_id, request, completion).await?;

        info!(guild = %session.guild_id, title = %track.title, offset = ?offset, stream, "Track started");
        state.begin_track(track.clone(), offset, Instant::now(), fresh, stream);

        if fresh {
            self.emit(PlayerEvent::TrackStarted {
                guild_id: session.guild_id,
                track,
            });
        }

        Ok(())
    }

    /// Starts the first queued track that can be started.
    async fn start_from_queue(&self, session: &GuildSession, state: &mut SessionState) -> Option<Track> {
        while let Some(next) = state.queue.dequeue_front() {
            match self.start_track(session, state, next.clone(), Duration::ZERO, true).await {
                Ok(()) => return Some(next),
                Err(PlayerError::NotConnected) => {
                    warn!(guild = %session.guild_id, "Not connected, dropping {}", next.title);
                    return None;
                }
                Err(why) => {
                    warn!(guild = %session.guild_id, title = %next.title, "Could not start track: {why}");
                    self.emit(PlayerEvent::PlaybackFailed {
                        guild_id: session.guild_id,
                        title: next.title.clone(),
                        reason: why.to_string(),
                    });
                }
            }
        }

        None
    }

    async fn advance(&self, session: &GuildSession, state: &mut SessionState) -> Advance {
        state.finish_current();

        if self.start_from_queue(session, state).await.is_some() {
            return Advance::Started;
        }

        if state.autoplay.enabled {
            let request = AutoplayRequest {
                guild_id: session.guild_id,
                playlist: state.autoplay.playlist.clone(),
                cursor: state.autoplay.cursor,
                recent: state.recently_played(REPEAT_WINDOW),
            };
            let token = state.begin_transition();
            debug!(guild = %session.guild_id, token, "Queue empty, looking for an autoplay track");

            return Advance::Autoplay { request, token };
        }

        info!(guild = %session.guild_id, "Queue finished");
        self.emit(PlayerEvent::QueueFinished {
            guild_id: session.guild_id,
        });
        self.go_idle(session, state);

        Advance::Idle
    }

    /// Runs the part of an advance that must not hold the guild lock.
    async fn follow_up(&self, session: &GuildSession, step: Advance) {
        match step {
            Advance::Autoplay { request, token } => self.continue_with_autoplay(session, request, token).await,
            Advance::Started | Advance::Idle => {}
        }
    }

    async fn continue_with_autoplay(&self, session: &GuildSession, request: AutoplayRequest, token: u64) {
        let pick = self.autoplay.select(&request).await;

        let mut state = session.state.lock().await;

        if !state.is_transition(token) {
            debug!(guild = %session.guild_id, "Session moved on while autoplay was looking, discarding");
            return;
        }

        if state.autoplay.playlist == request.playlist {
            state.autoplay.cursor = pick.cursor;
        }

        // Anything queued meanwhile goes first.
        if self.start_from_queue(session, &mut state).await.is_some() {
            return;
        }

        if let Some(track) = pick.track {
            match self.start_track(session, &mut state, track.clone(), Duration::ZERO, true).await {
                Ok(()) => return,
                Err(why) => {
                    warn!(guild = %session.guild_id, title = %track.title, "Could not start autoplay track: {why}");
                    self.emit(PlayerEvent::PlaybackFailed {
                        guild_id: session.guild_id,
                        title: track.title,
                        reason: why.to_string(),
                    });
                }
            }
        } else {
            info!(guild = %session.guild_id, "Autoplay found nothing to play");
        }

        self.emit(PlayerEvent::QueueFinished {
            guild_id: session.guild_id,
        });
        self.go_idle(session, &mut state);
    }

    async fn skip_locked(
        &self,
        session: &GuildSession,
        mut state: MutexGuard<'_, SessionState>,
    ) -> Result<Track, PlayerError> {
        let skipped = match (state.current(), state.is_active()) {
            (Some(track), true) => track.clone(),
            _ => return Err(PlayerError::NothingPlaying),
        };

        info!(guild = %session.guild_id, title = %skipped.title, "Skipping");
        state.suppress_next_completion();
        self.transport.stop(session.guild_id).await;

        let step = self.advance(session, &mut state).await;
        drop(state);
        self.follow_up(session, step).await;

        Ok(skipped)
    }

    fn go_idle(&self, session: &GuildSession, state: &mut SessionState) {
        let generation = state.enter_idle();
        let timer = tokio::spawn(idle_timer(session.events.clone(), self.settings.idle_timeout, generation));

        state.arm_idle_timer(timer);
        debug!(guild = %session.guild_id, generation, "Idle disconnect armed");
    }

    async fn handle_event(&self, session: &Arc<GuildSession>, event: GuildEvent) {
        if !self.is_registered(session) {
            debug!(?event, "Event for a closed session ignored");
            return;
        }

        match event {
            GuildEvent::TrackEnded { stream, error } => {
                if let Some(error) = &error {
                    warn!(guild = %session.guild_id, "Playback error: {error}");
                }

                let mut state = session.state.lock().await;

                match state.take_completion(stream) {
                    Completion::Advance => {
                        debug!(guild = %session.guild_id, "Track ended");
                        let step = self.advance(session, &mut state).await;
                        drop(state);
                        self.follow_up(session, step).await;
                    }
                    Completion::Swallowed => debug!(guild = %session.guild_id, stream, "Completion of a stopped stream swallowed"),
                    Completion::Stale => debug!(guild = %session.guild_id, stream, "Stale completion ignored"),
                }
            }
            GuildEvent::IdleTimeout { generation } => {
                let mut state = session.state.lock().await;

                if !state.is_idle_at(generation) {
                    debug!(guild = %session.guild_id, generation, "Stale idle timer ignored");
                    return;
                }

                info!(guild = %session.guild_id, "Disconnected due to inactivity");
                self.transport.disconnect(session.guild_id).await;
                state.queue.clear();

                {
                    let mut registry = self.registry();
                    if registry
                        .get(&session.guild_id)
                        .map_or(false, |registered| Arc::ptr_eq(registered, session))
                    {
                        registry.remove(&session.guild_id);
                    }
                }

                self.emit(PlayerEvent::IdleDisconnected {
                    guild_id: session.guild_id,
                });
            }
        }
    }
}

async fn idle_timer(events: UnboundedSender<GuildEvent>, delay: Duration, generation: u64) {
    tokio::time::sleep(delay).await;
    let _ = events.send(GuildEvent::IdleTimeout { generation });
}

async fn run_session_actor(
    coordinator: Weak<Coordinator>,
    session: Weak<GuildSession>,
    mut events: UnboundedReceiver<GuildEvent>,
) {
    while let Some(event) = events.recv().await {
        let (coordinator, session) = match (coordinator.upgrade(), session.upgrade()) {
            (Some(coordinator), Some(session)) => (coordinator, session),
            _ => break,
        };

        coordinator.handle_event(&session, event).await;
    }

    debug!("Session actor finished");
}
