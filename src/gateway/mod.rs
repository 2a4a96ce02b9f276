//! Transport seam to the chat platform
//!
//! The session core only talks to the platform through these traits. The
//! Discord implementation lives in [`discord`]; tests substitute in-memory
//! mocks.

pub mod discord;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::playback::Track;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw platform identifier
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake!(
    /// Community server identifier; the unit of session isolation
    GuildId
);
snowflake!(
    /// Text or voice channel identifier
    ChannelId
);
snowflake!(
    /// Member identifier
    UserId
);

/// Invoked exactly once when a track stops, with an error description if
/// playback failed
pub type CompletionCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// A message to send to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Channel identifier
    pub channel_id: ChannelId,

    /// Message content (plain text, may contain markdown)
    pub content: String,

    /// Member to ping ahead of the content
    pub mention: Option<UserId>,
}

impl OutgoingMessage {
    /// Create a simple `text` message
    #[must_use]
    pub fn text(channel_id: ChannelId, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            content: content.into(),
            mention: None,
        }
    }

    /// Create a message addressed to `user`
    #[must_use]
    pub fn mention(channel_id: ChannelId, user: UserId, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            content: content.into(),
            mention: Some(user),
        }
    }

    /// Content as it should appear on the wire, mention included
    #[must_use]
    pub fn rendered(&self) -> String {
        match self.mention {
            Some(user) => format!("<@{user}> {}", self.content),
            None => self.content.clone(),
        }
    }
}

/// Voice side of the platform gateway
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Attach to `channel` in `guild`
    async fn connect(&self, guild: GuildId, channel: ChannelId)
    -> Result<Arc<dyn VoiceConnection>>;

    /// Voice channel `user` currently sits in, if known
    async fn member_voice_channel(&self, _guild: GuildId, _user: UserId) -> Option<ChannelId> {
        None
    }

    /// Gateway heartbeat round-trip, if measured yet
    async fn latency(&self) -> Option<Duration> {
        None
    }
}

/// A live voice attachment for one guild
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Channel this connection is attached to
    fn channel_id(&self) -> ChannelId;

    /// Move the attachment to another channel of the same guild
    async fn move_to(&self, channel: ChannelId) -> Result<()>;

    /// Leave the voice channel
    async fn disconnect(&self) -> Result<()>;

    /// Whether the attachment is still established
    async fn is_alive(&self) -> bool;

    /// Start routing `track` into the channel at `volume`
    ///
    /// `on_finished` fires once when the track ends, errors, or is stopped.
    async fn play(
        &self,
        track: &Track,
        volume: f32,
        on_finished: CompletionCallback,
    ) -> Result<Box<dyn AudioSink>>;
}

/// Controls for one in-flight track
pub trait AudioSink: Send + Sync {
    /// Pause output
    ///
    /// # Errors
    ///
    /// Returns error if the track is gone
    fn pause(&self) -> Result<()>;

    /// Resume output
    ///
    /// # Errors
    ///
    /// Returns error if the track is gone
    fn resume(&self) -> Result<()>;

    /// Stop the track; triggers the completion callback if it has not fired
    ///
    /// # Errors
    ///
    /// Returns error if the track is gone
    fn stop(&self) -> Result<()>;

    /// Change output volume
    ///
    /// # Errors
    ///
    /// Returns error if the track is gone
    fn set_volume(&self, volume: f32) -> Result<()>;
}

/// Text side of the platform gateway
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a message
    ///
    /// Fails with `RateLimited`, `PermissionDenied` or `Transport`.
    async fn send(&self, message: OutgoingMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_is_rendered_first() {
        let msg = OutgoingMessage::mention(ChannelId(10), UserId(42), "wake up");
        assert_eq!(msg.rendered(), "<@42> wake up");
        assert_eq!(OutgoingMessage::text(ChannelId(10), "hi").rendered(), "hi");
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&GuildId(7)).unwrap();
        assert_eq!(json, "7");
        assert_eq!(GuildId::from(7).to_string(), "7");
    }
}
