//! Audio playback queue
//!
//! [`PlaybackQueue`] is the per-guild queue/loop-mode state machine. It is
//! synchronous: the session layer decides when to perform audio I/O based on
//! the [`PlayRequest`]s it returns.

mod queue;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use queue::{PlayRequest, PlaybackQueue, Rewind};

use crate::Error;

/// One queued playable item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// URL or local path handed to the decoder
    pub source: String,

    /// Name shown to members
    pub title: String,
}

impl Track {
    /// Create a track; an empty title falls back to the source
    #[must_use]
    pub fn new(source: impl Into<String>, title: impl Into<String>) -> Self {
        let source = source.into();
        let title = title.into();
        let title = if title.trim().is_empty() {
            source.clone()
        } else {
            title
        };
        Self { source, title }
    }
}

/// What happens to a track once it finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Finished tracks go to history
    #[default]
    Off,
    /// The finished track plays again
    Single,
    /// Finished tracks rejoin the end of the queue
    All,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Single => write!(f, "single"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for LoopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "single" | "one" | "track" => Ok(Self::Single),
            "all" | "queue" => Ok(Self::All),
            other => Err(Error::InvalidRequest(format!(
                "unknown loop mode '{other}' (expected off, single or all)"
            ))),
        }
    }
}

/// Coarse playback state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Nothing routed to the connection
    #[default]
    Idle,
    /// A track is audible
    Playing,
    /// A track is held
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Snapshot of a queue for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSummary {
    pub state: PlaybackState,
    pub current: Option<Track>,
    pub pending: Vec<Track>,
    pub history_len: usize,
    pub volume: f32,
    pub loop_mode: LoopMode,
}
