//! Per-guild session state.
//!
//! Everything in here is plain, synchronous data. The coordinator owns one [`SessionState`] per
//! guild behind that guild's lock and is the only code that calls the mutating methods.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serenity::model::id::UserId;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{PlayerError, SeekError};
use crate::models::Track;
use crate::queue::GuildQueue;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Playing,
    Paused,
    /// Between tracks while a continuation is being looked up.
    Transitioning,
}

/// How a completion of the live stream has to be read.
///
/// Completions of any other stream are stale whatever the marker says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMarker {
    /// No stream is live. Completions are stale.
    Idle,
    /// The live stream ending on its own means the queue moves on.
    Advance,
    /// The next completion comes from a stop we issued ourselves.
    Suppress,
}

/// What a completion event turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Advance,
    Swallowed,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Rewind,
    Forward,
}

/// Bounded play history, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    tracks: VecDeque<Track>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            tracks: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, track: Track) {
        if self.limit == 0 {
            return;
        }

        while self.tracks.len() >= self.limit {
            self.tracks.pop_front();
        }

        self.tracks.push_back(track);
    }

    pub fn last(&self) -> Option<&Track> {
        self.tracks.back()
    }

    /// Up to `count` most recent entries, oldest first.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &Track> {
        self.tracks.iter().skip(self.tracks.len().saturating_sub(count))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

/// Elapsed-time bookkeeping for the live stream. Paused iff `paused_at` is set.
#[derive(Debug, Default, Clone)]
struct Progress {
    started_at: Option<Instant>,
    offset: Duration,
    paused_total: Duration,
    paused_at: Option<Instant>,
}

impl Progress {
    fn start(&mut self, now: Instant, offset: Duration) {
        *self = Progress {
            started_at: Some(now),
            offset,
            ..Progress::default()
        };
    }

    fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(paused_at);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let started_at = match self.started_at {
            Some(started_at) => started_at,
            None => return Duration::ZERO,
        };

        let until = self.paused_at.unwrap_or(now);

        self.offset + until.saturating_duration_since(started_at).saturating_sub(self.paused_total)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoplaySettings {
    pub enabled: bool,
    pub playlist: Option<String>,
    pub cursor: usize,
}

#[derive(Debug)]
pub struct SessionState {
    pub(crate) queue: GuildQueue,
    current: Option<Track>,
    /// The last track that ended without being replaced; it joins the history when the next
    /// track starts.
    last_finished: Option<Track>,
    phase: Phase,
    progress: Progress,
    ballots: HashSet<UserId>,
    temporary_djs: HashSet<UserId>,
    history: History,
    pub(crate) autoplay: AutoplaySettings,
    volume: f32,
    marker: CompletionMarker,
    /// Last stream id handed out. Every start, seek restarts included, takes a new one.
    streams: u64,
    live_stream: Option<u64>,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    pub fn new(capacity: usize, volume: f32) -> Self {
        Self {
            queue: GuildQueue::new(capacity),
            current: None,
            last_finished: None,
            phase: Phase::Idle,
            progress: Progress::default(),
            ballots: HashSet::new(),
            temporary_djs: HashSet::new(),
            history: History::default(),
            autoplay: AutoplaySettings::default(),
            volume,
            marker: CompletionMarker::Idle,
            streams: 0,
            live_stream: None,
            generation: 0,
            idle_timer: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn marker(&self) -> CompletionMarker {
        self.marker
    }

    pub fn live_stream(&self) -> Option<u64> {
        self.live_stream
    }

    /// Reserves the id for a stream about to be started.
    pub fn next_stream(&mut self) -> u64 {
        self.streams += 1;
        self.streams
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn temporary_djs(&self) -> &HashSet<UserId> {
        &self.temporary_djs
    }

    pub fn ballots(&self) -> usize {
        self.ballots.len()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Playing | Phase::Paused)
    }

    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.as_ref().map_or(false, |timer| !timer.is_finished())
    }

    /// Elapsed time of the live stream, clamped to the track duration when it is known.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let elapsed = self.progress.elapsed(now);

        match self.current.as_ref().and_then(|track| track.duration) {
            Some(duration) => elapsed.min(duration),
            None => elapsed,
        }
    }

    /// The most recent played tracks, oldest first, including the one that just ended.
    pub fn recently_played(&self, count: usize) -> Vec<Track> {
        let mut recent: Vec<Track> = self.history.recent(count).cloned().collect();

        if let Some(finished) = &self.last_finished {
            recent.push(finished.clone());
        }

        let excess = recent.len().saturating_sub(count);
        recent.drain(..excess);
        recent
    }

    /// Records that `track` is now streaming from `offset` as `stream`.
    ///
    /// `fresh` is false for a seek restart of the current track, which must not touch the history.
    pub fn begin_track(&mut self, track: Track, offset: Duration, now: Instant, fresh: bool, stream: u64) {
        if fresh {
            if let Some(previous) = self.current.take().or_else(|| self.last_finished.take()) {
                self.history.push(previous);
            }
        }

        self.current = Some(track);
        self.progress.start(now, offset);
        self.ballots.clear();
        self.phase = Phase::Playing;
        self.generation += 1;
        self.cancel_idle_timer();
        self.live_stream = Some(stream);
        self.marker = CompletionMarker::Advance;
    }

    pub fn pause(&mut self, now: Instant) -> Result<(), PlayerError> {
        if self.phase != Phase::Playing {
            return Err(PlayerError::NothingPlaying);
        }

        self.progress.pause(now);
        self.phase = Phase::Paused;

        Ok(())
    }

    pub fn resume(&mut self, now: Instant) -> Result<(), PlayerError> {
        if self.phase != Phase::Paused {
            return Err(PlayerError::NotPaused);
        }

        self.progress.resume(now);
        self.phase = Phase::Playing;

        Ok(())
    }

    /// Checks a seek request against the live track and returns the track to restart.
    pub fn validate_seek(&self, target: Duration, direction: SeekDirection, now: Instant) -> Result<Track, PlayerError> {
        let track = match (&self.current, self.is_active()) {
            (Some(track), true) => track,
            _ => return Err(PlayerError::NothingPlaying),
        };

        if let Some(duration) = track.duration {
            if target > duration {
                return Err(SeekError::OutOfRange { target, duration }.into());
            }
        }

        let elapsed = self.elapsed(now);

        match direction {
            SeekDirection::Rewind if target >= elapsed => Err(SeekError::NotEarlier.into()),
            SeekDirection::Forward if target <= elapsed => Err(SeekError::NotLater.into()),
            _ => Ok(track.clone()),
        }
    }

    /// The live stream is about to be stopped by us; its completion must not advance the queue.
    pub fn suppress_next_completion(&mut self) {
        if self.current.is_some() && self.is_active() {
            self.marker = CompletionMarker::Suppress;
        }
    }

    /// Reads the completion of `stream`. Only the live stream's first completion counts.
    pub fn take_completion(&mut self, stream: u64) -> Completion {
        if self.live_stream != Some(stream) {
            return Completion::Stale;
        }

        self.live_stream = None;
        let marker = std::mem::replace(&mut self.marker, CompletionMarker::Idle);

        match marker {
            CompletionMarker::Advance if self.is_active() => Completion::Advance,
            CompletionMarker::Idle | CompletionMarker::Advance => Completion::Stale,
            CompletionMarker::Suppress => Completion::Swallowed,
        }
    }

    /// Moves the current track out of the way before the queue advances.
    pub fn finish_current(&mut self) -> Option<Track> {
        let finished = self.current.take();

        if let Some(track) = &finished {
            if let Some(older) = self.last_finished.replace(track.clone()) {
                self.history.push(older);
            }
        }

        self.progress = Progress::default();
        self.ballots.clear();

        finished
    }

    /// Enters `Transitioning` and returns the token a continuation must present.
    pub fn begin_transition(&mut self) -> u64 {
        self.phase = Phase::Transitioning;
        self.generation += 1;
        self.generation
    }

    pub fn is_transition(&self, token: u64) -> bool {
        self.phase == Phase::Transitioning && self.generation == token
    }

    /// Stops tracking playback. Returns the generation an idle timer has to match.
    pub fn enter_idle(&mut self) -> u64 {
        if let Some(track) = self.current.take() {
            if let Some(older) = self.last_finished.replace(track) {
                self.history.push(older);
            }
        }

        self.progress = Progress::default();
        self.ballots.clear();
        self.phase = Phase::Idle;
        self.generation += 1;

        if self.marker == CompletionMarker::Advance {
            self.marker = CompletionMarker::Idle;
        }

        self.generation
    }

    pub fn is_idle_at(&self, generation: u64) -> bool {
        self.phase == Phase::Idle && self.generation == generation
    }

    pub fn arm_idle_timer(&mut self, timer: JoinHandle<()>) {
        self.cancel_idle_timer();
        self.idle_timer = Some(timer);
    }

    pub fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Returns false when the voter already has a ballot for this track.
    pub fn cast_ballot(&mut self, voter: UserId) -> bool {
        self.ballots.insert(voter)
    }

    pub fn grant_dj(&mut self, user: UserId) -> bool {
        self.temporary_djs.insert(user)
    }

    pub fn revoke_dj(&mut self, user: UserId) -> bool {
        self.temporary_djs.remove(&user)
    }

    pub fn set_autoplay(&mut self, enabled: bool, playlist: Option<String>) {
        if self.autoplay.playlist != playlist {
            self.autoplay.cursor = 0;
        }

        self.autoplay.enabled = enabled;
        self.autoplay.playlist = playlist;
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.cancel_idle_timer();
    }
}

/// Number of ballots needed to skip with `listeners` humans in the channel.
pub fn vote_threshold(listeners: usize) -> usize {
    ((listeners + 1) / 2).max(1)
}
