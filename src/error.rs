//! Error types for the vigil session agent

use std::time::Duration;

use thiserror::Error;

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving guild sessions
#[derive(Debug, Error)]
pub enum Error {
    /// Operation requires a joined session or live connection that is absent
    #[error("not connected to a voice channel")]
    NotConnected,

    /// Nothing is playing or paused
    #[error("no track is playing")]
    NoActiveTrack,

    /// Play history is empty
    #[error("no previous track")]
    NoHistory,

    /// No queued track to move on to
    #[error("queue is empty")]
    QueueEmpty,

    /// Caller gave no channel and is not in a voice channel
    #[error("no voice channel given and caller is not in one")]
    NoVoiceChannel,

    /// Voice connection could not be established (retryable)
    #[error("connect error: {0}")]
    Connect(String),

    /// Transport asked us to slow down
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited {
        /// Cooldown hint supplied by the transport, if any
        retry_after: Option<Duration>,
    },

    /// Missing platform permission; surfaced as-is, never retried
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed command arguments
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable label used as the `kind` field of structured log lines
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::NoActiveTrack => "no_active_track",
            Self::NoHistory => "no_history",
            Self::QueueEmpty => "queue_empty",
            Self::NoVoiceChannel => "no_voice_channel",
            Self::Connect(_) => "connect",
            Self::RateLimited { .. } => "rate_limited",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Transport(_) => "transport",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Toml(_) => "toml",
        }
    }

    /// Whether a background loop should simply try again later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::RateLimited { .. } | Self::Transport(_)
        )
    }
}
