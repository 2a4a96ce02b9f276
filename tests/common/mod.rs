//! Shared test utilities: in-memory gateway, connection, sink and transport

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vigil::config::SessionConfig;
use vigil::{
    AudioSink, ChannelId, CompletionCallback, Error, GuildId, MessageTransport, OutgoingMessage,
    Result, SessionManager, SessionStatus, Track, UserId, VoiceConnection, VoiceGateway,
};

pub const GUILD: GuildId = GuildId(100);
pub const VOICE: ChannelId = ChannelId(200);
pub const OTHER_VOICE: ChannelId = ChannelId(201);
pub const TEXT: ChannelId = ChannelId(300);
pub const MEMBER: UserId = UserId(400);

/// Poll `check` until it holds, panicking after two seconds
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the guild's status until `check` holds, panicking after two seconds
pub async fn wait_for_status(
    manager: &SessionManager,
    guild: GuildId,
    what: &str,
    check: impl Fn(&SessionStatus) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check(&manager.session_status(guild).await) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `title` is the playing track (`None`: nothing playing)
pub async fn wait_for_current(manager: &SessionManager, guild: GuildId, title: Option<&str>) {
    wait_for_status(manager, guild, "current track", |status| {
        status
            .playback
            .as_ref()
            .and_then(|p| p.current.as_ref())
            .map(|t| t.title.as_str())
            == title
    })
    .await;
}

/// Let spawned completion handlers run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Session policy with a short connect timeout
#[must_use]
pub fn session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

/// A manager wired to fresh mocks
pub fn harness() -> (Arc<SessionManager>, Arc<MockGateway>, Arc<MockTransport>) {
    harness_with(session_config())
}

/// A manager with `config`, wired to fresh mocks
pub fn harness_with(
    config: SessionConfig,
) -> (Arc<SessionManager>, Arc<MockGateway>, Arc<MockTransport>) {
    let gateway = Arc::new(MockGateway::default());
    let transport = Arc::new(MockTransport::default());
    let manager = SessionManager::new(
        config,
        Arc::clone(&gateway) as Arc<dyn VoiceGateway>,
        Arc::clone(&transport) as Arc<dyn MessageTransport>,
    );
    (manager, gateway, transport)
}

/// Titles currently queued behind the playing track
pub async fn pending_titles(manager: &SessionManager, guild: GuildId) -> Vec<String> {
    manager
        .session_status(guild)
        .await
        .playback
        .map(|p| p.pending.into_iter().map(|t| t.title).collect())
        .unwrap_or_default()
}

/// Title of the track currently routed to the connection
pub async fn current_title(manager: &SessionManager, guild: GuildId) -> Option<String> {
    manager
        .session_status(guild)
        .await
        .playback
        .and_then(|p| p.current)
        .map(|t| t.title)
}

/// Gateway that records connect attempts
#[derive(Default)]
pub struct MockGateway {
    attempts: Mutex<Vec<(GuildId, ChannelId)>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    members: Mutex<HashMap<UserId, ChannelId>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    /// Make every connect attempt fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make connect attempts hang for `delay` first
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Place `user` in a voice channel
    pub fn put_member(&self, user: UserId, channel: ChannelId) {
        self.members.lock().unwrap().insert(user, channel);
    }

    /// Number of connect attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Most recently established connection
    pub fn last_connection(&self) -> Arc<MockConnection> {
        Arc::clone(self.connections.lock().unwrap().last().expect("no connection made"))
    }

    /// Number of connections established
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl VoiceGateway for MockGateway {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>> {
        self.attempts.lock().unwrap().push((guild, channel));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Connect("gateway unavailable".to_string()));
        }
        let conn = Arc::new(MockConnection::new(channel));
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }

    async fn member_voice_channel(&self, _guild: GuildId, user: UserId) -> Option<ChannelId> {
        self.members.lock().unwrap().get(&user).copied()
    }

    async fn latency(&self) -> Option<Duration> {
        Some(Duration::from_millis(42))
    }
}

/// In-memory voice attachment
pub struct MockConnection {
    channel: Mutex<ChannelId>,
    alive: AtomicBool,
    disconnected: AtomicBool,
    played: Mutex<Vec<String>>,
    sinks: Mutex<Vec<Arc<MockSinkState>>>,
    broken_sources: Mutex<HashSet<String>>,
    stuck_stop: AtomicBool,
}

impl MockConnection {
    fn new(channel: ChannelId) -> Self {
        Self {
            channel: Mutex::new(channel),
            alive: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            played: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            broken_sources: Mutex::new(HashSet::new()),
            stuck_stop: AtomicBool::new(false),
        }
    }

    /// Simulate the platform dropping the attachment
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Simulate a moderator dragging the agent elsewhere
    pub fn drag_to(&self, channel: ChannelId) {
        *self.channel.lock().unwrap() = channel;
    }

    /// Make `source` fail to start
    pub fn break_source(&self, source: &str) {
        self.broken_sources.lock().unwrap().insert(source.to_string());
    }

    /// Make future sinks refuse `stop`
    pub fn set_stuck_stop(&self, stuck: bool) {
        self.stuck_stop.store(stuck, Ordering::SeqCst);
    }

    /// Titles started so far, in order
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    /// Whether `disconnect` was called
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Sink of the most recently started track
    pub fn last_sink(&self) -> Arc<MockSinkState> {
        Arc::clone(self.sinks.lock().unwrap().last().expect("nothing played"))
    }

    /// Let the most recently started track end naturally
    pub fn finish_current(&self) {
        self.last_sink().finish(None);
    }
}

#[async_trait]
impl VoiceConnection for MockConnection {
    fn channel_id(&self) -> ChannelId {
        *self.channel.lock().unwrap()
    }

    async fn move_to(&self, channel: ChannelId) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Connect("connection is gone".to_string()));
        }
        *self.channel.lock().unwrap() = channel;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn play(
        &self,
        track: &Track,
        volume: f32,
        on_finished: CompletionCallback,
    ) -> Result<Box<dyn AudioSink>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.broken_sources.lock().unwrap().contains(&track.source) {
            return Err(Error::Transport(format!("cannot decode {}", track.source)));
        }

        self.played.lock().unwrap().push(track.title.clone());
        let state = Arc::new(MockSinkState {
            title: track.title.clone(),
            callback: Mutex::new(Some(on_finished)),
            volume: Mutex::new(volume),
            paused: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            stuck_stop: self.stuck_stop.load(Ordering::SeqCst),
        });
        self.sinks.lock().unwrap().push(Arc::clone(&state));
        Ok(Box::new(MockSink(state)))
    }
}

/// Observable state of one started track
pub struct MockSinkState {
    pub title: String,
    callback: Mutex<Option<CompletionCallback>>,
    volume: Mutex<f32>,
    paused: AtomicBool,
    stops: AtomicUsize,
    stuck_stop: bool,
}

impl MockSinkState {
    /// End the track; the completion callback fires at most once
    pub fn finish(&self, error: Option<String>) {
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct MockSink(Arc<MockSinkState>);

impl AudioSink for MockSink {
    fn pause(&self) -> Result<()> {
        self.0.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.0.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        if self.0.stuck_stop {
            return Err(Error::Transport("stop not acknowledged".to_string()));
        }
        self.0.finish(None);
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        *self.0.volume.lock().unwrap() = volume;
        Ok(())
    }
}

/// Transport that records delivered messages and replays scripted failures
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<OutgoingMessage>>,
    failures: Mutex<VecDeque<Error>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
}

impl MockTransport {
    /// Make every send take `delay` before completing
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Sends started but not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Fail the next send with `error`
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Messages delivered so far
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
