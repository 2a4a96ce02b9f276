//! Periodic session statistics

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::playback::PlaybackState;
use crate::session::{SessionHandle, SessionManager};

/// Aggregate counts across all guilds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Registered sessions
    pub sessions: usize,
    /// Sessions holding a voice connection
    pub attached: usize,
    /// Sessions with a track playing or paused
    pub playing: usize,
    /// Tracks waiting across all queues
    pub queued_tracks: usize,
    /// Running broadcast campaigns
    pub active_campaigns: usize,
    /// When these numbers were computed; `None` before the first refresh
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Recomputes [`SessionStats`] on an interval
pub struct StatsRefresher {
    manager: Arc<SessionManager>,
    interval: Duration,
}

impl StatsRefresher {
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Recompute, cache on the manager and return the statistics
    ///
    /// Guilds are read concurrently, so one guild holding its lock does not
    /// hold up reading the others.
    pub async fn refresh(&self) -> SessionStats {
        let snapshot = self.manager.registry().snapshot();
        let counts = join_all(snapshot.iter().map(|(_, handle)| Self::count(handle))).await;

        let mut stats = SessionStats::default();
        for count in counts.into_iter().flatten() {
            stats.sessions += count.sessions;
            stats.attached += count.attached;
            stats.playing += count.playing;
            stats.queued_tracks += count.queued_tracks;
            stats.active_campaigns += count.active_campaigns;
        }
        stats.refreshed_at = Some(Utc::now());

        tracing::debug!(
            sessions = stats.sessions,
            attached = stats.attached,
            playing = stats.playing,
            queued_tracks = stats.queued_tracks,
            active_campaigns = stats.active_campaigns,
            "stats refreshed"
        );
        self.manager.store_stats(stats.clone());
        stats
    }

    /// One guild's contribution; `None` once the session has been closed
    async fn count(handle: &SessionHandle) -> Option<SessionStats> {
        let session = handle.lock().await;
        if session.is_closed() {
            return None;
        }
        let queue = session.playback.as_ref();
        Some(SessionStats {
            sessions: 1,
            attached: usize::from(session.connection.is_some()),
            playing: usize::from(queue.is_some_and(|q| q.state() != PlaybackState::Idle)),
            queued_tracks: queue.map_or(0, |q| q.pending_len()),
            active_campaigns: usize::from(session.broadcast.is_some()),
            refreshed_at: None,
        })
    }

    /// Refresh until `shutdown` flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("stats refresher stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}
