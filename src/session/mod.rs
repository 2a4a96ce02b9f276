//! Per-guild session orchestration
//!
//! [`SessionManager`] owns the [`SessionRegistry`] and is the only place that
//! mutates a guild's connection, playback queue and broadcast campaign.
//! Command handlers, the reconnect watchdog, the broadcast scheduler and
//! audio completion events all funnel through the same per-guild lock.

mod registry;
mod status;

use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, mpsc};
use uuid::Uuid;

pub use registry::{GuildSession, SessionHandle, SessionRegistry};
pub use status::SessionStatus;

use crate::broadcast::{BroadcastCampaign, Repeat};
use crate::config::SessionConfig;
use crate::gateway::{
    ChannelId, CompletionCallback, GuildId, MessageTransport, UserId, VoiceConnection,
    VoiceGateway,
};
use crate::playback::{LoopMode, PlayRequest, PlaybackQueue, PlaybackState, Rewind, Track};
use crate::stats::SessionStats;
use crate::{Error, Result};

/// A track to start, bound to the connection it must play on
pub(crate) type PendingStart = (Arc<dyn VoiceConnection>, PlayRequest);

/// An audio sink reported the end of a track
#[derive(Debug)]
struct TrackEnded {
    guild: GuildId,
    generation: u64,
    error: Option<String>,
}

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new attachment was established
    Connected,
    /// An existing attachment moved channels
    Moved,
    /// Already live in the requested channel
    AlreadyThere,
}

/// Result of an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Place in the waiting queue (1 = next); 0 when it started right away
    pub position: usize,
    /// Whether the track was started immediately
    pub started: bool,
}

/// Entry point for every session operation
pub struct SessionManager {
    registry: SessionRegistry,
    gateway: Arc<dyn VoiceGateway>,
    transport: Arc<dyn MessageTransport>,
    config: SessionConfig,
    track_events: mpsc::UnboundedSender<TrackEnded>,
    stats: RwLock<SessionStats>,
}

impl SessionManager {
    /// Create a manager and spawn its completion pump
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        gateway: Arc<dyn VoiceGateway>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            registry: SessionRegistry::new(),
            gateway,
            transport,
            config,
            track_events: tx,
            stats: RwLock::new(SessionStats::default()),
        });
        tokio::spawn(pump_track_events(Arc::downgrade(&manager), rx));
        manager
    }

    /// Session store
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Outbound message transport
    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    /// Session policy
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Attach to `channel`, moving an existing attachment if needed
    ///
    /// The channel becomes the guild's desired channel even if the attempt
    /// fails, so the watchdog keeps retrying it.
    ///
    /// # Errors
    ///
    /// `Connect` when the attachment cannot be made within the timeout, or
    /// whatever the gateway reports (e.g. `PermissionDenied`)
    pub async fn join_session(&self, guild: GuildId, channel: ChannelId) -> Result<JoinOutcome> {
        let (handle, mut guard) = self.registry.lock_or_create(guild).await;
        guard.desired_channel = Some(channel);

        let existing = match guard.connection.clone() {
            Some(conn) if conn.is_alive().await => Some(conn),
            Some(_) => {
                tracing::debug!(guild_id = %guild, "dropping dead connection before join");
                guard.connection = None;
                guard.attached_since = None;
                if let Some(queue) = guard.playback.as_mut() {
                    queue.interrupt();
                }
                None
            }
            None => None,
        };

        let outcome = match existing {
            Some(conn) if conn.channel_id() == channel => JoinOutcome::AlreadyThere,
            Some(conn) => {
                self.bounded("move", conn.move_to(channel)).await?;
                guard.attached_since = Some(Utc::now());
                tracing::info!(guild_id = %guild, channel_id = %channel, "voice moved");
                JoinOutcome::Moved
            }
            None => {
                let conn = self.connect_with_timeout(guild, channel).await?;
                guard.connection = Some(conn);
                guard.attached_since = Some(Utc::now());
                tracing::info!(guild_id = %guild, channel_id = %channel, "voice joined");
                JoinOutcome::Connected
            }
        };

        let start = Self::next_to_start(&mut guard);
        drop(guard);
        if let Some((conn, request)) = start {
            self.start_track(&handle, guild, conn, request).await;
        }
        Ok(outcome)
    }

    /// Join the channel given, or the one `user` currently sits in
    ///
    /// # Errors
    ///
    /// `NoVoiceChannel` when no channel is given and `user` is not in voice;
    /// otherwise as [`Self::join_session`]
    pub async fn join_member_channel(
        &self,
        guild: GuildId,
        user: UserId,
        channel: Option<ChannelId>,
    ) -> Result<(ChannelId, JoinOutcome)> {
        let channel = match channel {
            Some(channel) => channel,
            None => self
                .gateway
                .member_voice_channel(guild, user)
                .await
                .ok_or(Error::NoVoiceChannel)?,
        };
        let outcome = self.join_session(guild, channel).await?;
        Ok((channel, outcome))
    }

    /// Tear down everything for `guild`
    ///
    /// Stops audio, clears the campaign and the desired channel, disconnects
    /// and removes the session. Returns whether anything was torn down;
    /// calling it again is a no-op.
    pub async fn leave_session(&self, guild: GuildId) -> bool {
        let Some(handle) = self.registry.get(guild) else {
            return false;
        };
        let mut guard = handle.lock().await;
        if guard.is_closed() {
            return false;
        }

        let had_state = !guard.is_vacant();
        guard.close();
        guard.desired_channel = None;
        guard.attached_since = None;
        if let Some(campaign) = guard.broadcast.take() {
            campaign.cancel();
            tracing::info!(guild_id = %guild, campaign = %campaign.id(), "broadcast cancelled by leave");
        }
        if let Some(mut queue) = guard.playback.take() {
            queue.shutdown();
        }
        if let Some(conn) = guard.connection.take() {
            // Disconnect under the lock so a racing join cannot be torn down
            if let Err(e) = self.bounded("disconnect", conn.disconnect()).await {
                tracing::warn!(guild_id = %guild, kind = e.kind(), error = %e, "disconnect failed");
            }
        }
        drop(guard);

        self.registry.remove(guild, &handle);
        tracing::info!(guild_id = %guild, "session left");
        had_state
    }

    /// Queue a track, starting it if nothing is playing
    ///
    /// # Errors
    ///
    /// `NotConnected` when the guild has not joined voice, `InvalidRequest`
    /// for an empty locator
    pub async fn enqueue_track(
        &self,
        guild: GuildId,
        source: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Enqueued> {
        let track = Track::new(source, title);
        if track.source.trim().is_empty() {
            return Err(Error::InvalidRequest("track source is empty".to_string()));
        }

        let (handle, mut guard) = self.joined_session(guild).await?;
        let session = &mut *guard;
        let connected = session.connection.is_some();
        let queue = session
            .playback
            .get_or_insert_with(|| PlaybackQueue::new(self.config.default_volume, self.config.history_limit));

        tracing::debug!(guild_id = %guild, title = %track.title, "track queued");
        queue.enqueue(track);
        let position = queue.pending_len();
        let request = if connected { queue.start_if_idle() } else { None };
        let started = request.is_some();
        let start = request.and_then(|request| Self::bind_connection(session, request));

        drop(guard);
        if let Some((conn, request)) = start {
            self.start_track(&handle, guild, conn, request).await;
        }
        Ok(Enqueued {
            position: if started { 0 } else { position },
            started,
        })
    }

    /// Stop the current track and move on
    ///
    /// # Errors
    ///
    /// `NotConnected`, `NoActiveTrack`, or `QueueEmpty` when nothing follows
    pub async fn skip(&self, guild: GuildId) -> Result<()> {
        let (handle, mut guard) = self.joined_session(guild).await?;
        let session = &mut *guard;
        let queue = session.playback.as_mut().ok_or(Error::NoActiveTrack)?;
        let next = queue.skip()?;
        tracing::debug!(guild_id = %guild, "track skipped");

        let start = next.and_then(|request| Self::bind_connection(session, request));
        drop(guard);
        if let Some((conn, request)) = start {
            self.start_track(&handle, guild, conn, request).await;
        }
        Ok(())
    }

    /// Replay the most recently finished track
    ///
    /// # Errors
    ///
    /// `NotConnected`, or `NoHistory` when nothing has finished yet
    pub async fn previous(&self, guild: GuildId) -> Result<()> {
        let (handle, mut guard) = self.joined_session(guild).await?;
        let session = &mut *guard;
        let can_start = session.connection.is_some();
        let queue = session.playback.as_mut().ok_or(Error::NoHistory)?;

        let start = match queue.previous(can_start)? {
            Rewind::Stopping | Rewind::Queued => None,
            Rewind::Start(request) => Self::bind_connection(session, request),
        };
        tracing::debug!(guild_id = %guild, "rewinding to previous track");

        drop(guard);
        if let Some((conn, request)) = start {
            self.start_track(&handle, guild, conn, request).await;
        }
        Ok(())
    }

    /// Hold the current track; reports the resulting state
    ///
    /// # Errors
    ///
    /// `NotConnected` when the guild has not joined voice
    pub async fn pause(&self, guild: GuildId) -> Result<PlaybackState> {
        let (_, mut guard) = self.joined_session(guild).await?;
        Ok(guard
            .playback
            .as_mut()
            .map_or(PlaybackState::Idle, PlaybackQueue::pause))
    }

    /// Continue a held track; reports the resulting state
    ///
    /// # Errors
    ///
    /// `NotConnected` when the guild has not joined voice
    pub async fn resume(&self, guild: GuildId) -> Result<PlaybackState> {
        let (_, mut guard) = self.joined_session(guild).await?;
        Ok(guard
            .playback
            .as_mut()
            .map_or(PlaybackState::Idle, PlaybackQueue::resume))
    }

    /// Set the volume, clamped to policy; returns the applied value
    ///
    /// # Errors
    ///
    /// `NotConnected` when the guild has not joined voice
    pub async fn set_volume(&self, guild: GuildId, volume: f32) -> Result<f32> {
        let volume = self.config.clamp_volume(volume);
        let (_, mut guard) = self.joined_session(guild).await?;
        self.queue_mut(&mut guard).set_volume(volume);
        tracing::debug!(guild_id = %guild, volume, "volume set");
        Ok(volume)
    }

    /// Change loop mode from the next completion on
    ///
    /// # Errors
    ///
    /// `NotConnected` when the guild has not joined voice
    pub async fn set_loop_mode(&self, guild: GuildId, mode: LoopMode) -> Result<()> {
        let (_, mut guard) = self.joined_session(guild).await?;
        self.queue_mut(&mut guard).set_loop_mode(mode);
        tracing::debug!(guild_id = %guild, %mode, "loop mode set");
        Ok(())
    }

    /// Start (or replace) the guild's repeated-message campaign
    ///
    /// Does not require a voice attachment.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a zero count or empty message
    pub async fn start_broadcast(
        &self,
        guild: GuildId,
        target: UserId,
        body: impl Into<String>,
        channel: ChannelId,
        repeat: Repeat,
    ) -> Result<Uuid> {
        let campaign = BroadcastCampaign::new(target, body, channel, repeat)?;
        let id = campaign.id();

        let (_, mut guard) = self.registry.lock_or_create(guild).await;
        if let Some(previous) = guard.broadcast.replace(campaign) {
            previous.cancel();
            tracing::info!(guild_id = %guild, campaign = %previous.id(), "broadcast replaced");
        }
        tracing::info!(
            guild_id = %guild,
            campaign = %id,
            target = %target,
            channel_id = %channel,
            %repeat,
            "broadcast started"
        );
        Ok(id)
    }

    /// Cancel the guild's campaign; returns whether one was active
    pub async fn stop_broadcast(&self, guild: GuildId) -> bool {
        let Some(handle) = self.registry.get(guild) else {
            return false;
        };
        let mut guard = handle.lock().await;
        if guard.is_closed() {
            return false;
        }
        let stopped = guard.broadcast.take();
        if let Some(campaign) = &stopped {
            campaign.cancel();
            tracing::info!(guild_id = %guild, campaign = %campaign.id(), sent = campaign.sent(), "broadcast stopped");
        }
        self.discard_if_vacant(guild, &handle, &mut guard);
        stopped.is_some()
    }

    /// Snapshot of the guild's session
    pub async fn session_status(&self, guild: GuildId) -> SessionStatus {
        let Some(handle) = self.registry.get(guild) else {
            return SessionStatus::detached(guild);
        };
        let guard = handle.lock().await;
        if guard.is_closed() {
            return SessionStatus::detached(guild);
        }

        let attached = match &guard.connection {
            Some(conn) => conn.is_alive().await,
            None => false,
        };
        SessionStatus {
            guild_id: guild,
            attached,
            channel_id: guard.connection.as_ref().map(|conn| conn.channel_id()),
            desired_channel_id: guard.desired_channel,
            attached_since: guard.attached_since,
            playback: guard.playback.as_ref().map(PlaybackQueue::summary),
            broadcast: guard.broadcast.as_ref().map(BroadcastCampaign::summary),
        }
    }

    /// Gateway heartbeat latency, if measured yet
    pub async fn latency(&self) -> Option<Duration> {
        self.gateway.latency().await
    }

    /// Most recently computed statistics
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn store_stats(&self, stats: SessionStats) {
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    /// Connect, bounded by the connect timeout
    pub(crate) async fn connect_with_timeout(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>> {
        self.bounded("connect", self.gateway.connect(guild, channel))
            .await
    }

    /// Move an attachment, bounded by the connect timeout
    pub(crate) async fn move_with_timeout(
        &self,
        conn: &Arc<dyn VoiceConnection>,
        channel: ChannelId,
    ) -> Result<()> {
        self.bounded("move", conn.move_to(channel)).await
    }

    /// Drop the session from the registry once nothing is left in it
    pub(crate) fn discard_if_vacant(
        &self,
        guild: GuildId,
        handle: &SessionHandle,
        session: &mut GuildSession,
    ) {
        if session.is_vacant() && !session.is_closed() {
            session.close();
            self.registry.remove(guild, handle);
        }
    }

    /// The track an idle queue should start now, if connected
    pub(crate) fn next_to_start(session: &mut GuildSession) -> Option<PendingStart> {
        let conn = session.connection.clone()?;
        let request = session.playback.as_mut()?.start_if_idle()?;
        Some((conn, request))
    }

    /// Start tracks until one is attached or the queue runs dry
    ///
    /// `play` runs without the guild lock; the sink is then handed to the
    /// queue, which discards it if the request went stale in the meantime.
    pub(crate) async fn start_track(
        &self,
        handle: &SessionHandle,
        guild: GuildId,
        mut conn: Arc<dyn VoiceConnection>,
        mut request: PlayRequest,
    ) {
        loop {
            let on_finished = self.completion_callback(guild, request.generation);
            let outcome = match conn.play(&request.track, request.volume, on_finished).await {
                Ok(sink) => Ok(sink),
                Err(e) => {
                    let lost = !conn.is_alive().await;
                    Err((e, lost))
                }
            };

            let mut guard = handle.lock().await;
            let session = &mut *guard;
            let closed = session.is_closed();
            let queue = match session.playback.as_mut() {
                Some(queue) if !closed => queue,
                _ => {
                    if let Ok(sink) = outcome {
                        if let Err(e) = sink.stop() {
                            tracing::debug!(guild_id = %guild, error = %e, "orphaned sink already gone");
                        }
                    }
                    return;
                }
            };

            let (e, lost) = match outcome {
                Ok(sink) => {
                    if queue.attach(&request, sink) {
                        tracing::info!(
                            guild_id = %guild,
                            generation = request.generation,
                            title = %request.track.title,
                            "track started"
                        );
                    }
                    return;
                }
                Err(failure) => failure,
            };

            tracing::warn!(
                guild_id = %guild,
                kind = e.kind(),
                error = %e,
                title = %request.track.title,
                connection_lost = lost,
                "track failed to start"
            );
            let Some(Some(next)) = queue.start_failed(request.generation, lost) else {
                return;
            };
            let Some((next_conn, next_request)) = Self::bind_connection(session, next) else {
                return;
            };
            drop(guard);
            conn = next_conn;
            request = next_request;
        }
    }

    fn completion_callback(&self, guild: GuildId, generation: u64) -> CompletionCallback {
        let events = self.track_events.clone();
        Box::new(move |error| {
            if events
                .send(TrackEnded {
                    guild,
                    generation,
                    error,
                })
                .is_err()
            {
                tracing::debug!(guild_id = %guild, "track ended after shutdown");
            }
        })
    }

    async fn handle_track_end(&self, event: TrackEnded) {
        let TrackEnded {
            guild,
            generation,
            error,
        } = event;
        if let Some(error) = &error {
            tracing::warn!(guild_id = %guild, generation, kind = "playback", %error, "track ended with error");
        }

        let Some(handle) = self.registry.get(guild) else {
            tracing::trace!(guild_id = %guild, generation, "completion for departed guild");
            return;
        };
        let mut guard = handle.lock().await;
        if guard.is_closed() {
            return;
        }
        let session = &mut *guard;
        let Some(queue) = session.playback.as_mut() else {
            return;
        };
        let Some(next) = queue.complete(generation) else {
            tracing::trace!(guild_id = %guild, generation, "stale completion ignored");
            return;
        };
        tracing::debug!(guild_id = %guild, generation, "track finished");

        let start = next.and_then(|request| Self::bind_connection(session, request));
        drop(guard);
        if let Some((conn, request)) = start {
            self.start_track(&handle, guild, conn, request).await;
        }
    }

    /// Pair a chosen track with the live connection, or put it back
    fn bind_connection(session: &mut GuildSession, request: PlayRequest) -> Option<PendingStart> {
        if let Some(conn) = session.connection.clone() {
            return Some((conn, request));
        }
        if let Some(queue) = session.playback.as_mut() {
            queue.interrupt();
        }
        None
    }

    fn queue_mut<'a>(&self, session: &'a mut GuildSession) -> &'a mut PlaybackQueue {
        session
            .playback
            .get_or_insert_with(|| PlaybackQueue::new(self.config.default_volume, self.config.history_limit))
    }

    async fn joined_session(
        &self,
        guild: GuildId,
    ) -> Result<(SessionHandle, OwnedMutexGuard<GuildSession>)> {
        let handle = self.registry.get(guild).ok_or(Error::NotConnected)?;
        let guard = Arc::clone(&handle).lock_owned().await;
        if guard.is_closed() || !guard.is_joined() {
            return Err(Error::NotConnected);
        }
        Ok((handle, guard))
    }

    async fn bounded<T, F>(&self, action: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.config.connect_timeout;
        tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(Error::Connect(format!(
                "{action} timed out after {}s",
                limit.as_secs()
            )))
        })
    }
}

/// Apply completion events behind the guild locks
async fn pump_track_events(
    manager: Weak<SessionManager>,
    mut events: mpsc::UnboundedReceiver<TrackEnded>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        tokio::spawn(async move { manager.handle_track_end(event).await });
    }
    tracing::debug!("track event pump stopped");
}
