//! Guild → session store
//!
//! One `tokio::sync::Mutex` per guild is the serialization point for every
//! mutation of that guild's connection, queue and campaign.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::broadcast::BroadcastCampaign;
use crate::gateway::{ChannelId, GuildId, VoiceConnection};
use crate::playback::PlaybackQueue;

/// Shared handle to one guild's session
pub type SessionHandle = Arc<Mutex<GuildSession>>;

/// Live state for one guild
#[derive(Default)]
pub struct GuildSession {
    /// Channel the agent should stay in; `None` means not pinned
    pub desired_channel: Option<ChannelId>,

    /// When the current connection was established
    pub attached_since: Option<DateTime<Utc>>,

    /// Live voice attachment
    pub connection: Option<Arc<dyn VoiceConnection>>,

    /// Playback queue, created on first use
    pub playback: Option<PlaybackQueue>,

    /// Active repeated-message campaign
    pub broadcast: Option<BroadcastCampaign>,

    closed: bool,
}

impl std::fmt::Debug for GuildSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildSession")
            .field("desired_channel", &self.desired_channel)
            .field("attached_since", &self.attached_since)
            .field("connected", &self.connection.is_some())
            .field("playback", &self.playback)
            .field("broadcast", &self.broadcast)
            .field("closed", &self.closed)
            .finish()
    }
}

impl GuildSession {
    /// Whether `leave` has torn this entry down
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the entry dead; later holders of a stale handle must ignore it
    pub(crate) const fn close(&mut self) {
        self.closed = true;
    }

    /// Whether a voice join is in effect (connected or pinned for reconnect)
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        self.desired_channel.is_some() || self.connection.is_some()
    }

    /// Whether nothing is left worth keeping
    #[must_use]
    pub const fn is_vacant(&self) -> bool {
        self.desired_channel.is_none()
            && self.connection.is_none()
            && self.playback.is_none()
            && self.broadcast.is_none()
    }
}

/// Concurrency-safe map of guild sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<GuildId, SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a guild's session
    #[must_use]
    pub fn get(&self, guild: GuildId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&guild)
            .cloned()
    }

    /// Look up a guild's session, creating an empty one if absent
    #[must_use]
    pub fn get_or_create(&self, guild: GuildId) -> SessionHandle {
        if let Some(handle) = self.get(guild) {
            return handle;
        }
        let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(guild).or_insert_with(|| {
            tracing::debug!(guild_id = %guild, "session created");
            Arc::new(Mutex::new(GuildSession::default()))
        }))
    }

    /// Lock a guild's live session, creating it if absent
    ///
    /// Retries when it races a `leave` that closed the entry it found; the
    /// closed entry is evicted so the retry gets a fresh one.
    pub async fn lock_or_create(
        &self,
        guild: GuildId,
    ) -> (SessionHandle, OwnedMutexGuard<GuildSession>) {
        loop {
            let handle = self.get_or_create(guild);
            let guard = Arc::clone(&handle).lock_owned().await;
            if !guard.is_closed() {
                return (handle, guard);
            }
            drop(guard);
            self.remove(guild, &handle);
        }
    }

    /// Remove the guild's entry if it is still `handle`
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, guild: GuildId, handle: &SessionHandle) -> bool {
        let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match map.get(&guild) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                map.remove(&guild);
                tracing::debug!(guild_id = %guild, "session removed");
                true
            }
            _ => false,
        }
    }

    /// Every session currently registered
    #[must_use]
    pub fn snapshot(&self) -> Vec<(GuildId, SessionHandle)> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(guild, handle)| (*guild, Arc::clone(handle)))
            .collect()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
