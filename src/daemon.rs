//! Daemon - the long-running agent
//!
//! Connects to Discord, wires the session manager to the gateway, and runs
//! the watchdog, broadcast scheduler and stats refresher until Ctrl-C.

use std::sync::{Arc, OnceLock};

use songbird::Songbird;
use tokio::sync::watch;

use crate::broadcast::BroadcastScheduler;
use crate::gateway::VoiceGateway;
use crate::gateway::discord::{self, DiscordGateway, DiscordHandler};
use crate::session::SessionManager;
use crate::stats::StatsRefresher;
use crate::watchdog::ReconnectWatchdog;
use crate::{Config, Error, Result};

/// External process used to resolve and transcode remote tracks
const FETCHER_BINARY: &str = "yt-dlp";

/// The agent process
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a daemon from validated configuration
    ///
    /// # Errors
    ///
    /// Returns `Config` if no bot token is configured
    pub fn new(config: Config) -> Result<Self> {
        if config.discord_token.is_none() {
            return Err(Error::Config(
                "no Discord token; set DISCORD_TOKEN, --token or [discord] token".to_string(),
            ));
        }
        Ok(Self { config })
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the Discord client cannot be built
    pub async fn run(self) -> Result<()> {
        let token = self
            .config
            .discord_token
            .as_ref()
            .ok_or_else(|| Error::Config("no Discord token".to_string()))?;

        match which::which(FETCHER_BINARY) {
            Ok(path) => tracing::debug!(path = %path.display(), "track fetcher found"),
            Err(_) => tracing::warn!(
                binary = FETCHER_BINARY,
                "track fetcher not on PATH; only local files will play"
            ),
        }

        let songbird = Songbird::serenity();
        let manager_cell = Arc::new(OnceLock::new());
        let handler = DiscordHandler::new(
            Arc::clone(&manager_cell),
            self.config.command_prefix.clone(),
        );
        let mut client = discord::build_client(token, handler, Arc::clone(&songbird)).await?;

        let gateway = Arc::new(DiscordGateway::from_client(&client, songbird));
        let voice: Arc<dyn VoiceGateway> = Arc::clone(&gateway) as Arc<dyn VoiceGateway>;
        let manager = SessionManager::new(self.config.session.clone(), voice, gateway);
        if manager_cell.set(Arc::clone(&manager)).is_err() {
            tracing::warn!("session manager already installed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watchdog = ReconnectWatchdog::new(Arc::clone(&manager), self.config.watchdog.clone());
        let scheduler =
            BroadcastScheduler::new(Arc::clone(&manager), self.config.broadcast.clone());
        let refresher = StatsRefresher::new(Arc::clone(&manager), self.config.stats.interval);
        let background = [
            tokio::spawn(watchdog.run(shutdown_rx.clone())),
            tokio::spawn(scheduler.run(shutdown_rx.clone())),
            tokio::spawn(refresher.run(shutdown_rx)),
        ];

        let shard_manager = Arc::clone(&client.shard_manager);
        let client_task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::error!(error = %e, "discord client stopped");
            }
        });

        tracing::info!(prefix = %self.config.command_prefix, "vigil running");

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutting down");

        // Stop background loops before leaving voice so none of them reconnects
        let _ = shutdown_tx.send(true);
        for task in background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        for (guild, _) in manager.registry().snapshot() {
            manager.leave_session(guild).await;
        }

        shard_manager.shutdown_all().await;
        if let Err(e) = client_task.await {
            tracing::warn!(error = %e, "discord client task ended abnormally");
        }

        tracing::info!("daemon stopped");
        Ok(())
    }
}
