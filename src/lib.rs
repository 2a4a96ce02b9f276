//! Vigil - always-on voice session agent
//!
//! Keeps a presence in Discord voice channels, plays queued audio and runs
//! recurring background work per guild:
//! - Reconnect watchdog that keeps each guild in its desired channel
//! - Playback queue with single/all loop modes and history
//! - Scheduled repeated messages ("broadcasts") with rate-limit cooldown
//! - Periodic statistics refresh
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Chat commands  │  Watchdog  │  Scheduler     │
//! └────────────────────────┬─────────────────────────────┘
//!                          │
//! ┌────────────────────────▼─────────────────────────────┐
//! │                  SessionManager                       │
//! │   per-guild lock → connection │ queue │ campaign      │
//! └────────────────────────┬─────────────────────────────┘
//!                          │
//! ┌────────────────────────▼─────────────────────────────┐
//! │        Gateway traits (serenity + songbird)           │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod broadcast;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod playback;
pub mod session;
pub mod stats;
pub mod watchdog;

pub use broadcast::{BroadcastCampaign, BroadcastReport, BroadcastScheduler, Repeat};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use gateway::{
    AudioSink, ChannelId, CompletionCallback, GuildId, MessageTransport, OutgoingMessage, UserId,
    VoiceConnection, VoiceGateway,
};
pub use playback::{LoopMode, PlaybackState, PlaybackSummary, Track};
pub use session::{Enqueued, JoinOutcome, SessionManager, SessionStatus};
pub use stats::{SessionStats, StatsRefresher};
pub use watchdog::{ReconnectWatchdog, WatchdogReport};
