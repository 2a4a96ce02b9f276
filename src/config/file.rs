//! TOML configuration file loading
//!
//! Supports `~/.config/vigil/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VigilConfigFile {
    /// Discord connection settings
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Per-guild session policy
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Reconnect watchdog timing
    #[serde(default)]
    pub watchdog: WatchdogFileConfig,

    /// Broadcast scheduler timing
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,

    /// Statistics refresh timing
    #[serde(default)]
    pub stats: StatsFileConfig,
}

/// Discord settings
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordFileConfig {
    /// Bot token (prefer the `DISCORD_TOKEN` env var)
    pub token: Option<String>,

    /// Prefix for text commands (e.g. "!")
    pub command_prefix: Option<String>,
}

/// Session policy
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionFileConfig {
    pub connect_timeout_secs: Option<u64>,
    pub default_volume: Option<f32>,
    pub min_volume: Option<f32>,
    pub max_volume: Option<f32>,
    pub history_limit: Option<usize>,
}

/// Watchdog timing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogFileConfig {
    pub interval_secs: Option<u64>,
}

/// Broadcast timing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastFileConfig {
    pub interval_ms: Option<u64>,
    pub rate_limit_cooldown_ms: Option<u64>,
}

/// Stats timing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsFileConfig {
    pub interval_secs: Option<u64>,
}

/// Load the TOML config file from `path`
///
/// A missing file yields `VigilConfigFile::default()`.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<VigilConfigFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(VigilConfigFile::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the default config file path: `~/.config/vigil/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("vigil").join("config.toml"))
}
