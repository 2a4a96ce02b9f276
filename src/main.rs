use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use vigil::{Config, Daemon};

/// Vigil - always-on voice session agent for Discord
#[derive(Parser)]
#[command(name = "vigil", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/vigil/config.toml)
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Discord bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Command prefix for chat commands
    #[arg(long)]
    prefix: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,vigil=info",
        1 => "info,vigil=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(token) = cli.token {
        config.discord_token = Some(SecretString::from(token));
    }
    if let Some(prefix) = cli.prefix {
        config.command_prefix = prefix;
    }
    config.validate()?;

    tracing::debug!(
        watchdog_secs = config.watchdog.interval.as_secs(),
        broadcast_ms = u64::try_from(config.broadcast.interval.as_millis()).unwrap_or(u64::MAX),
        connect_timeout_secs = config.session.connect_timeout.as_secs(),
        "configuration loaded"
    );

    Daemon::new(config)?.run().await?;
    Ok(())
}
