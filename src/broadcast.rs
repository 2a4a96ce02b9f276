//! Repeated-message campaigns
//!
//! At most one [`BroadcastCampaign`] is active per guild. The
//! [`BroadcastScheduler`] sends every active campaign's message once per
//! tick, decrementing finite campaigns until they are exhausted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::BroadcastConfig;
use crate::gateway::{ChannelId, GuildId, OutgoingMessage, UserId};
use crate::session::{SessionHandle, SessionManager};
use crate::{Error, Result};

/// How many times a campaign sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// A fixed number of remaining sends
    Times(u32),
    /// Until explicitly stopped
    Forever,
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Times(n) => write!(f, "{n}"),
            Self::Forever => write!(f, "forever"),
        }
    }
}

impl FromStr for Repeat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if matches!(s.as_str(), "forever" | "inf" | "infinite" | "unlimited") {
            return Ok(Self::Forever);
        }
        let n: u32 = s
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("'{s}' is not a count or 'forever'")))?;
        if n == 0 {
            return Err(Error::InvalidRequest("count must be at least 1".to_string()));
        }
        Ok(Self::Times(n))
    }
}

/// A scheduled repeated message aimed at one member in one channel
#[derive(Debug, Clone)]
pub struct BroadcastCampaign {
    id: Uuid,
    target: UserId,
    body: String,
    channel: ChannelId,
    remaining: Repeat,
    sent: u64,
    cooldown_until: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl BroadcastCampaign {
    /// Create a campaign
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a zero count or an empty message
    pub fn new(
        target: UserId,
        body: impl Into<String>,
        channel: ChannelId,
        remaining: Repeat,
    ) -> Result<Self> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(Error::InvalidRequest("broadcast message is empty".to_string()));
        }
        if remaining == Repeat::Times(0) {
            return Err(Error::InvalidRequest("count must be at least 1".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            target,
            body,
            channel,
            remaining,
            sent: 0,
            cooldown_until: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Identity; a replacement campaign always has a new one
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Member being addressed
    #[must_use]
    pub const fn target(&self) -> UserId {
        self.target
    }

    /// Message text
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Destination channel
    #[must_use]
    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Sends left
    #[must_use]
    pub const fn remaining(&self) -> Repeat {
        self.remaining
    }

    /// Successful sends so far
    #[must_use]
    pub const fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether a rate-limit cooldown is still running at `now`
    #[must_use]
    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// The message one tick sends
    #[must_use]
    pub fn message(&self) -> OutgoingMessage {
        OutgoingMessage::mention(self.channel, self.target, self.body.clone())
    }

    /// Withdraw the campaign; a send not yet handed to the transport is dropped
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Count one successful send; returns whether the campaign is exhausted
    pub fn record_sent(&mut self) -> bool {
        self.sent += 1;
        self.cooldown_until = None;
        match &mut self.remaining {
            Repeat::Forever => false,
            Repeat::Times(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        }
    }

    /// Suspend sends until `until`
    pub const fn cool_down(&mut self, until: Instant) {
        self.cooldown_until = Some(until);
    }

    /// Snapshot for status reporting
    #[must_use]
    pub const fn summary(&self) -> BroadcastSummary {
        BroadcastSummary {
            id: self.id,
            target: self.target,
            channel: self.channel,
            remaining: self.remaining,
            sent: self.sent,
        }
    }
}

/// Serializable view of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    pub id: Uuid,
    pub target: UserId,
    pub channel: ChannelId,
    pub remaining: Repeat,
    pub sent: u64,
}

/// What one scheduler tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Messages delivered
    pub sent: usize,
    /// Sends refused by the transport's rate limiter
    pub rate_limited: usize,
    /// Sends that failed otherwise
    pub failed: usize,
    /// Campaigns that reached zero and were removed
    pub finished: usize,
    /// Guilds whose lock stayed busy for the whole tick
    pub deferred: usize,
}

impl BroadcastReport {
    /// Whether the tick touched any campaign
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.sent + self.rate_limited + self.failed + self.deferred > 0
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Idle => {}
            Outcome::Deferred => self.deferred += 1,
            Outcome::Sent { finished } => {
                self.sent += 1;
                if finished {
                    self.finished += 1;
                }
            }
            Outcome::RateLimited => self.rate_limited += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Result of one guild's share of a tick
enum Outcome {
    Idle,
    Deferred,
    Sent { finished: bool },
    RateLimited,
    Failed,
}

/// Periodic sender for every guild's active campaign
pub struct BroadcastScheduler {
    manager: Arc<SessionManager>,
    config: BroadcastConfig,
}

impl BroadcastScheduler {
    /// Create a scheduler over `manager`'s sessions
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>, config: BroadcastConfig) -> Self {
        Self { manager, config }
    }

    /// Send once for every active, non-cooling campaign
    ///
    /// Each guild runs as its own future: a guild whose lock is held (for
    /// example by a hung connect) is deferred after one interval without
    /// delaying any other guild's send. A result is applied only if the
    /// campaign that produced it is still the guild's campaign.
    pub async fn tick(&self) -> BroadcastReport {
        let now = Instant::now();
        let outcomes = join_all(
            self.manager
                .registry()
                .snapshot()
                .into_iter()
                .map(|(guild, handle)| self.tick_guild(guild, handle, now)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        report
    }

    async fn tick_guild(&self, guild: GuildId, handle: SessionHandle, now: Instant) -> Outcome {
        let Ok(session) = tokio::time::timeout(self.lock_wait(), handle.lock()).await else {
            tracing::debug!(guild_id = %guild, "guild busy, broadcast deferred");
            return Outcome::Deferred;
        };
        if session.is_closed() {
            return Outcome::Idle;
        }
        let Some(campaign) = session.broadcast.as_ref() else {
            return Outcome::Idle;
        };
        if campaign.is_cooling_down(now) {
            tracing::trace!(guild_id = %guild, "broadcast cooling down");
            return Outcome::Idle;
        }
        let id = campaign.id();
        let message = campaign.message();
        let cancelled = Arc::clone(&campaign.cancelled);
        drop(session);

        // A stop that landed while the lock was released wins
        if cancelled.load(Ordering::SeqCst) {
            return Outcome::Idle;
        }
        let result = self.manager.transport().send(message).await;

        let mut session = handle.lock().await;
        let closed = session.is_closed();
        let campaign = session
            .broadcast
            .as_mut()
            .filter(|c| !closed && c.id() == id);

        match result {
            Ok(()) => {
                let Some(campaign) = campaign else {
                    return Outcome::Sent { finished: false };
                };
                if !campaign.record_sent() {
                    return Outcome::Sent { finished: false };
                }
                tracing::info!(
                    guild_id = %guild,
                    campaign = %id,
                    sent = campaign.sent(),
                    "broadcast campaign finished"
                );
                session.broadcast = None;
                self.manager.discard_if_vacant(guild, &handle, &mut session);
                Outcome::Sent { finished: true }
            }
            Err(Error::RateLimited { retry_after }) => {
                let cooldown = retry_after.map_or(self.config.rate_limit_cooldown, |hint| {
                    hint.max(self.config.rate_limit_cooldown)
                });
                if let Some(campaign) = campaign {
                    campaign.cool_down(Instant::now() + cooldown);
                }
                tracing::warn!(
                    guild_id = %guild,
                    kind = "rate_limited",
                    cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
                    "broadcast rate limited, cooling down"
                );
                Outcome::RateLimited
            }
            Err(e) => {
                tracing::warn!(
                    guild_id = %guild,
                    kind = e.kind(),
                    error = %e,
                    "broadcast send failed, retrying next tick"
                );
                Outcome::Failed
            }
        }
    }

    /// How long a tick waits for a guild's lock before deferring it
    const fn lock_wait(&self) -> Duration {
        self.config.interval
    }

    /// Tick until `shutdown` flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "broadcast scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("broadcast scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.is_active() {
                        tracing::trace!(?report, "broadcast tick");
                    }
                }
            }
        }
    }
}
