//! Reconnect watchdog
//!
//! Every tick, each guild pinned to a voice channel is checked; a missing or
//! dead attachment is re-established with a single attempt. Failures are
//! logged and retried on the next tick, forever.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::WatchdogConfig;
use crate::gateway::GuildId;
use crate::session::{SessionHandle, SessionManager};

/// What one watchdog tick found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Guilds with a desired channel
    pub checked: usize,
    /// Attachments that were live in the right channel
    pub healthy: usize,
    /// Attachments restored or moved back this tick
    pub reconnected: usize,
    /// Repair attempts that failed
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repair {
    Skipped,
    Healthy,
    Reconnected,
    Failed,
}

/// Periodic repair of lost voice attachments
pub struct ReconnectWatchdog {
    manager: Arc<SessionManager>,
    config: WatchdogConfig,
}

impl ReconnectWatchdog {
    /// Create a watchdog over `manager`'s sessions
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>, config: WatchdogConfig) -> Self {
        Self { manager, config }
    }

    /// Check every pinned guild once, concurrently
    pub async fn tick(&self) -> WatchdogReport {
        let sessions = self.manager.registry().snapshot();
        let outcomes = join_all(
            sessions
                .into_iter()
                .map(|(guild, handle)| self.repair(guild, handle)),
        )
        .await;

        let mut report = WatchdogReport::default();
        for outcome in outcomes {
            match outcome {
                Repair::Skipped => continue,
                Repair::Healthy => report.healthy += 1,
                Repair::Reconnected => report.reconnected += 1,
                Repair::Failed => report.failed += 1,
            }
            report.checked += 1;
        }
        report
    }

    async fn repair(&self, guild: GuildId, handle: SessionHandle) -> Repair {
        let mut guard = handle.lock().await;
        if guard.is_closed() {
            return Repair::Skipped;
        }
        let Some(channel) = guard.desired_channel else {
            return Repair::Skipped;
        };

        if let Some(conn) = guard.connection.clone() {
            if conn.is_alive().await {
                if conn.channel_id() == channel {
                    return Repair::Healthy;
                }
                // Dragged elsewhere; go back
                return match self.manager.move_with_timeout(&conn, channel).await {
                    Ok(()) => {
                        guard.attached_since = Some(Utc::now());
                        tracing::info!(guild_id = %guild, channel_id = %channel, "voice moved back to desired channel");
                        Repair::Reconnected
                    }
                    Err(e) => {
                        tracing::warn!(
                            guild_id = %guild,
                            channel_id = %channel,
                            kind = e.kind(),
                            error = %e,
                            "move back failed"
                        );
                        Repair::Failed
                    }
                };
            }

            tracing::warn!(guild_id = %guild, channel_id = %conn.channel_id(), "voice connection lost");
            guard.connection = None;
            guard.attached_since = None;
            if let Some(queue) = guard.playback.as_mut() {
                queue.interrupt();
            }
        }

        match self.manager.connect_with_timeout(guild, channel).await {
            Ok(conn) => {
                guard.connection = Some(conn);
                guard.attached_since = Some(Utc::now());
                tracing::info!(guild_id = %guild, channel_id = %channel, "voice reconnected");

                let start = SessionManager::next_to_start(&mut guard);
                drop(guard);
                if let Some((conn, request)) = start {
                    self.manager.start_track(&handle, guild, conn, request).await;
                }
                Repair::Reconnected
            }
            Err(e) => {
                tracing::warn!(
                    guild_id = %guild,
                    channel_id = %channel,
                    kind = e.kind(),
                    error = %e,
                    "reconnect failed, retrying next tick"
                );
                Repair::Failed
            }
        }
    }

    /// Tick until `shutdown` flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "reconnect watchdog started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("reconnect watchdog stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.reconnected > 0 || report.failed > 0 {
                        tracing::debug!(?report, "watchdog tick");
                    } else {
                        tracing::trace!(?report, "watchdog tick");
                    }
                }
            }
        }
    }
}
