//! Discord gateway using serenity for text and songbird for voice

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serenity::Client;
use serenity::all::{
    Cache, Context, CreateAllowedMentions, CreateMessage, EventHandler, GatewayIntents, Http,
    Message, Ready, ShardManager,
};
use serenity::http::HttpError;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::{File, Input, YoutubeDl};
use songbird::tracks::{PlayMode, Track as VoiceTrack, TrackHandle};
use songbird::{Call, SerenityInit, Songbird};
use tokio::sync::Mutex;

use super::{
    AudioSink, ChannelId, CompletionCallback, GuildId, MessageTransport, OutgoingMessage, UserId,
    VoiceConnection, VoiceGateway,
};
use crate::commands::{self, Command};
use crate::playback::Track;
use crate::session::SessionManager;
use crate::{Error, Result};

/// Gateway intents the agent needs: guild cache, voice states and commands
const INTENTS: GatewayIntents = GatewayIntents::GUILDS
    .union(GatewayIntents::GUILD_VOICE_STATES)
    .union(GatewayIntents::GUILD_MESSAGES)
    .union(GatewayIntents::MESSAGE_CONTENT);

/// Build the serenity client with voice support registered
///
/// # Errors
///
/// Returns error if the client cannot be constructed (e.g. malformed token)
pub async fn build_client(
    token: &SecretString,
    handler: DiscordHandler,
    songbird: Arc<Songbird>,
) -> Result<Client> {
    Client::builder(token.expose_secret(), INTENTS)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await
        .map_err(|e| Error::Transport(format!("discord client error: {e}")))
}

/// Voice and message access backed by a running serenity client
pub struct DiscordGateway {
    http: Arc<Http>,
    cache: Arc<Cache>,
    shard_manager: Arc<ShardManager>,
    songbird: Arc<Songbird>,
    fetcher: reqwest::Client,
}

impl DiscordGateway {
    /// Share the client's HTTP, cache and shards
    #[must_use]
    pub fn from_client(client: &Client, songbird: Arc<Songbird>) -> Self {
        Self {
            http: Arc::clone(&client.http),
            cache: Arc::clone(&client.cache),
            shard_manager: Arc::clone(&client.shard_manager),
            songbird,
            fetcher: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VoiceGateway for DiscordGateway {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>> {
        let call = self
            .songbird
            .join(guild_id(guild)?, channel_id(channel)?)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;

        tracing::debug!(guild_id = %guild, channel_id = %channel, "voice call established");
        Ok(Arc::new(DiscordConnection {
            guild,
            channel: AtomicU64::new(channel.get()),
            call,
            songbird: Arc::clone(&self.songbird),
            fetcher: self.fetcher.clone(),
        }))
    }

    async fn member_voice_channel(&self, guild: GuildId, user: UserId) -> Option<ChannelId> {
        let guild = guild_id(guild).ok()?;
        let user = serenity::all::UserId::new(nonzero(user.get()).ok()?);
        self.cache
            .guild(guild)
            .and_then(|g| g.voice_states.get(&user).and_then(|state| state.channel_id))
            .map(|channel| ChannelId(channel.get()))
    }

    async fn latency(&self) -> Option<Duration> {
        let runners = self.shard_manager.runners.lock().await;
        runners.values().find_map(|runner| runner.latency)
    }
}

#[async_trait]
impl MessageTransport for DiscordGateway {
    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let channel = serenity::all::ChannelId::new(nonzero(message.channel_id.get())?);

        let mut builder = CreateMessage::new().content(message.rendered());
        if let Some(user) = message.mention {
            let user = serenity::all::UserId::new(nonzero(user.get())?);
            builder = builder.allowed_mentions(CreateAllowedMentions::new().users([user]));
        }

        channel
            .send_message(&self.http, builder)
            .await
            .map_err(send_error)?;

        tracing::trace!(channel_id = %message.channel_id, "discord message sent");
        Ok(())
    }
}

/// One guild's songbird call
struct DiscordConnection {
    guild: GuildId,
    channel: AtomicU64,
    call: Arc<Mutex<Call>>,
    songbird: Arc<Songbird>,
    fetcher: reqwest::Client,
}

impl DiscordConnection {
    fn input_for(&self, track: &Track) -> Result<Input> {
        let source = track.source.as_str();
        if source.starts_with("http://") || source.starts_with("https://") {
            // Resolved and transcoded by the external yt-dlp process
            return Ok(YoutubeDl::new(self.fetcher.clone(), source.to_string()).into());
        }
        if !Path::new(source).is_file() {
            return Err(Error::InvalidRequest(format!("no such file: {source}")));
        }
        Ok(File::new(source.to_string()).into())
    }
}

#[async_trait]
impl VoiceConnection for DiscordConnection {
    fn channel_id(&self) -> ChannelId {
        ChannelId(self.channel.load(Ordering::Relaxed))
    }

    async fn move_to(&self, channel: ChannelId) -> Result<()> {
        self.songbird
            .join(guild_id(self.guild)?, channel_id(channel)?)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        self.channel.store(channel.get(), Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        match self.songbird.remove(guild_id(self.guild)?).await {
            Ok(()) | Err(songbird::error::JoinError::NoCall) => Ok(()),
            Err(e) => Err(Error::Connect(e.to_string())),
        }
    }

    async fn is_alive(&self) -> bool {
        self.call.lock().await.current_connection().is_some()
    }

    async fn play(
        &self,
        track: &Track,
        volume: f32,
        on_finished: CompletionCallback,
    ) -> Result<Box<dyn AudioSink>> {
        let input = self.input_for(track)?;

        let handle = {
            let mut call = self.call.lock().await;
            if call.current_connection().is_none() {
                return Err(Error::NotConnected);
            }
            call.play_only(VoiceTrack::new(input).volume(volume))
        };

        let notifier = TrackEndNotifier::new(on_finished);
        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), notifier.clone()) {
                // The track is already over; nothing will report its end
                if let Err(stop) = handle.stop() {
                    tracing::debug!(guild_id = %self.guild, error = %stop, "track already gone");
                }
                return Err(Error::Transport(format!("track ended before start: {e}")));
            }
        }

        Ok(Box::new(DiscordSink { handle }))
    }
}

/// Fires the completion callback once, for whichever of end/error comes first
#[derive(Clone)]
struct TrackEndNotifier {
    callback: Arc<StdMutex<Option<CompletionCallback>>>,
}

impl TrackEndNotifier {
    fn new(callback: CompletionCallback) -> Self {
        Self {
            callback: Arc::new(StdMutex::new(Some(callback))),
        }
    }
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(e.to_string()),
                _ => None,
            }),
            _ => None,
        };

        let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(callback) = callback {
            callback(error);
        }
        Some(Event::Cancel)
    }
}

/// Controls for a songbird track
struct DiscordSink {
    handle: TrackHandle,
}

impl AudioSink for DiscordSink {
    fn pause(&self) -> Result<()> {
        self.handle.pause().map_err(track_error)
    }

    fn resume(&self) -> Result<()> {
        self.handle.play().map_err(track_error)
    }

    fn stop(&self) -> Result<()> {
        self.handle.stop().map_err(track_error)
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.handle.set_volume(volume).map_err(track_error)
    }
}

/// Routes prefixed chat commands into the session manager
pub struct DiscordHandler {
    manager: Arc<OnceLock<Arc<SessionManager>>>,
    prefix: String,
}

impl DiscordHandler {
    /// Create a handler; `manager` is filled in once the client exists
    #[must_use]
    pub const fn new(manager: Arc<OnceLock<Arc<SessionManager>>>, prefix: String) -> Self {
        Self { manager, prefix }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "discord bot ready"
        );
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild) = msg.guild_id else {
            return;
        };
        let Some(parsed) = Command::parse(&self.prefix, &msg.content) else {
            return;
        };
        let Some(manager) = self.manager.get() else {
            tracing::debug!("command received before startup finished");
            return;
        };

        let guild = GuildId(guild.get());
        let user = UserId(msg.author.id.get());
        tracing::debug!(guild_id = %guild, user = %user, command = ?parsed, "command received");

        let reply = match parsed {
            Ok(command) => match commands::execute(manager, guild, user, command).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(guild_id = %guild, kind = e.kind(), error = %e, "command failed");
                    commands::error_reply(&e)
                }
            },
            Err(e) => commands::error_reply(&e),
        };

        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            tracing::warn!(guild_id = %guild, kind = send_error(e).kind(), "failed to send reply");
        }
    }
}

fn nonzero(id: u64) -> Result<u64> {
    if id == 0 {
        return Err(Error::InvalidRequest("id must be non-zero".to_string()));
    }
    Ok(id)
}

fn guild_id(id: GuildId) -> Result<serenity::all::GuildId> {
    nonzero(id.get()).map(serenity::all::GuildId::new)
}

fn channel_id(id: ChannelId) -> Result<serenity::all::ChannelId> {
    nonzero(id.get()).map(serenity::all::ChannelId::new)
}

fn track_error(e: songbird::tracks::ControlError) -> Error {
    Error::Transport(format!("track control failed: {e}"))
}

/// Classify a serenity failure for the session layer
fn send_error(e: serenity::Error) -> Error {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &e {
        match response.status_code.as_u16() {
            429 => return Error::RateLimited { retry_after: None },
            403 => return Error::PermissionDenied(response.error.message.clone()),
            _ => {}
        }
    }
    Error::Transport(e.to_string())
}
