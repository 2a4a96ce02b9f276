use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::BroadcastSummary;
use crate::gateway::{ChannelId, GuildId};
use crate::playback::PlaybackSummary;

/// Point-in-time view of one guild's session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub guild_id: GuildId,

    /// A live, healthy voice connection exists
    pub attached: bool,

    /// Channel of the current connection, live or not
    pub channel_id: Option<ChannelId>,

    /// Channel the watchdog keeps the agent in
    pub desired_channel_id: Option<ChannelId>,

    pub attached_since: Option<DateTime<Utc>>,

    pub playback: Option<PlaybackSummary>,

    pub broadcast: Option<BroadcastSummary>,
}

impl SessionStatus {
    /// Status of a guild with no session
    #[must_use]
    pub const fn detached(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            attached: false,
            channel_id: None,
            desired_channel_id: None,
            attached_since: None,
            playback: None,
            broadcast: None,
        }
    }

    /// How long the current attachment has lasted at `now`
    #[must_use]
    pub fn attached_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if !self.attached {
            return None;
        }
        self.attached_since
            .map(|since| (now - since).max(chrono::Duration::zero()))
    }
}
