//! Configuration management for the vigil agent
//!
//! Layers, lowest priority first: built-in defaults, the TOML file, then
//! environment variables. CLI flags are applied on top by `main.rs`.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use self::file::VigilConfigFile;
use crate::{Error, Result};

/// Default text command prefix
pub const DEFAULT_COMMAND_PREFIX: &str = "!";

/// vigil agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: Option<SecretString>,

    /// Prefix for text commands
    pub command_prefix: String,

    /// Per-guild session policy
    pub session: SessionConfig,

    /// Reconnect watchdog
    pub watchdog: WatchdogConfig,

    /// Broadcast scheduler
    pub broadcast: BroadcastConfig,

    /// Statistics refresh
    pub stats: StatsConfig,
}

/// Per-guild session policy
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Upper bound on a single connect or move attempt
    pub connect_timeout: Duration,

    /// Volume applied to a freshly created queue
    pub default_volume: f32,

    /// Lowest accepted volume
    pub min_volume: f32,

    /// Highest accepted volume
    pub max_volume: f32,

    /// Number of finished tracks remembered for "previous"
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(12),
            default_volume: 0.5,
            min_volume: 0.0,
            max_volume: 2.0,
            history_limit: 500,
        }
    }
}

impl SessionConfig {
    /// Clamp a requested volume into the accepted range
    #[must_use]
    pub fn clamp_volume(&self, volume: f32) -> f32 {
        if volume.is_nan() {
            return self.default_volume;
        }
        volume.clamp(self.min_volume, self.max_volume)
    }
}

/// Reconnect watchdog timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Time between liveness checks
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Broadcast scheduler timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Time between sends of an active campaign
    pub interval: Duration,

    /// Pause applied to a guild's campaign after a rate-limit signal
    pub rate_limit_cooldown: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            rate_limit_cooldown: Duration::from_millis(4000),
        }
    }
}

/// Statistics refresh timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsConfig {
    /// Time between refreshes
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: None,
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            session: SessionConfig::default(),
            watchdog: WatchdogConfig::default(),
            broadcast: BroadcastConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the given file (or the default path) and the
    /// process environment
    ///
    /// # Errors
    ///
    /// Returns error if the file is malformed or values fail validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => file::load_config_file(p)?,
            None => match file::config_file_path() {
                Some(p) => file::load_config_file(&p)?,
                None => VigilConfigFile::default(),
            },
        };

        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment value does not parse or the merged
    /// values fail validation
    pub fn from_sources<F>(file: VigilConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let discord_token = env("DISCORD_TOKEN")
            .or(file.discord.token)
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);

        let command_prefix = env("VIGIL_COMMAND_PREFIX")
            .or(file.discord.command_prefix)
            .unwrap_or(defaults.command_prefix);

        let connect_timeout_secs = match env_u64(&env, "VIGIL_CONNECT_TIMEOUT_SECS")? {
            Some(v) => Some(v),
            None => file.session.connect_timeout_secs,
        };
        let session = SessionConfig {
            connect_timeout: connect_timeout_secs
                .map_or(defaults.session.connect_timeout, Duration::from_secs),
            default_volume: file
                .session
                .default_volume
                .unwrap_or(defaults.session.default_volume),
            min_volume: file.session.min_volume.unwrap_or(defaults.session.min_volume),
            max_volume: file.session.max_volume.unwrap_or(defaults.session.max_volume),
            history_limit: file
                .session
                .history_limit
                .unwrap_or(defaults.session.history_limit),
        };

        let watchdog_secs = match env_u64(&env, "VIGIL_WATCHDOG_INTERVAL_SECS")? {
            Some(v) => Some(v),
            None => file.watchdog.interval_secs,
        };
        let watchdog = WatchdogConfig {
            interval: watchdog_secs.map_or(defaults.watchdog.interval, Duration::from_secs),
        };

        let broadcast_ms = match env_u64(&env, "VIGIL_BROADCAST_INTERVAL_MS")? {
            Some(v) => Some(v),
            None => file.broadcast.interval_ms,
        };
        let broadcast = BroadcastConfig {
            interval: broadcast_ms.map_or(defaults.broadcast.interval, Duration::from_millis),
            rate_limit_cooldown: file
                .broadcast
                .rate_limit_cooldown_ms
                .map_or(defaults.broadcast.rate_limit_cooldown, Duration::from_millis),
        };

        let stats = StatsConfig {
            interval: file
                .stats
                .interval_secs
                .map_or(defaults.stats.interval, Duration::from_secs),
        };

        let config = Self {
            discord_token,
            command_prefix,
            session,
            watchdog,
            broadcast,
            stats,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("session.connect_timeout", self.session.connect_timeout),
            ("watchdog.interval", self.watchdog.interval),
            ("broadcast.interval", self.broadcast.interval),
            ("broadcast.rate_limit_cooldown", self.broadcast.rate_limit_cooldown),
            ("stats.interval", self.stats.interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        let s = &self.session;
        if !(s.min_volume <= s.default_volume && s.default_volume <= s.max_volume) {
            return Err(Error::Config(format!(
                "volume range invalid: min {} <= default {} <= max {} does not hold",
                s.min_volume, s.default_volume, s.max_volume
            )));
        }

        if s.history_limit == 0 {
            return Err(Error::Config("session.history_limit must be at least 1".to_string()));
        }

        if self.command_prefix.trim().is_empty() {
            return Err(Error::Config("command prefix must not be empty".to_string()));
        }

        Ok(())
    }
}

fn env_u64<F>(env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}
