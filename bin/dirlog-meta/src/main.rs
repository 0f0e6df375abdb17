//! Dirlog Meta - Container metadata daemon
//!
//! Boots the container namespace from its change log and either serves it
//! (following the primary in replica mode) or runs an operator action.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirlog_common::StoreConfig;
use dirlog_namespace::ContainerStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dirlog-meta")]
#[command(about = "Dirlog container metadata service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dirlog/meta.toml")]
    config: String,

    /// Change log path
    #[arg(long, env = "DIRLOG_CHANGELOG")]
    changelog_path: Option<PathBuf>,

    /// Follow the change log of a primary
    #[arg(long)]
    slave: bool,

    /// Cut a corrupt log tail at boot instead of failing
    #[arg(long)]
    auto_repair: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot and keep serving until interrupted
    Run {
        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },
    /// Boot read-only and print statistics as JSON
    Inspect,
    /// Compact the change log of a primary
    Compact,
    /// Promote a replica to primary
    Promote {
        /// Where the promoted change log lives
        #[arg(long)]
        new_path: PathBuf,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    store: Option<StoreConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Serialize)]
struct Inspection {
    stats: dirlog_namespace::StoreStats,
    warnings: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&config_str).with_context(|| format!("parsing {}", args.config))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let log_level = if args.log_level != "info" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };
    let mut store_config = config.store.unwrap_or_default();
    if let Some(path) = args.changelog_path.clone() {
        store_config.changelog_path = path;
    }
    if args.slave {
        store_config.slave_mode = true;
    }
    if args.auto_repair {
        store_config.auto_repair = true;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dirlog-meta");
    info!("Config file: {}", args.config);
    info!("Change log: {:?}", store_config.changelog_path);

    match args.command {
        Command::Run { stats_interval } => run(store_config, stats_interval).await,
        Command::Inspect => {
            // Never write to a log that is only being looked at
            store_config.slave_mode = true;
            let store = ContainerStore::open(store_config)?;
            let inspection = Inspection {
                stats: store.stats(),
                warnings: store.warning_messages(),
            };
            println!("{}", serde_json::to_string_pretty(&inspection)?);
            Ok(())
        }
        Command::Compact => {
            store_config.slave_mode = false;
            let store = ContainerStore::open(store_config)?;
            let report = store.compact()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Promote { new_path } => {
            store_config.slave_mode = true;
            let store = ContainerStore::open(store_config)?;
            store.slave_to_master(&new_path)?;
            info!("Promoted to primary, change log at {:?}", new_path);
            println!("{}", serde_json::to_string_pretty(&store.stats())?);
            Ok(())
        }
    }
}

async fn run(store_config: StoreConfig, stats_interval: u64) -> Result<()> {
    let store = ContainerStore::open(store_config).context("booting container store")?;
    for warning in store.warning_messages() {
        warn!("Boot: {}", warning);
    }

    if store.mode().is_replica() {
        store.start_following()?;
        info!("Following change log from offset {}", store.follow_offset());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                let stats = store.stats();
                info!(
                    "{} containers, log {} bytes, follower {:?} at {}",
                    stats.containers, stats.log_size, stats.follower_state, stats.follow_offset
                );
                if stats.resync_required {
                    error!("Followed change log was replaced, restart required");
                    break;
                }
            }
        }
    }

    store.stop_following();
    store.sync()?;
    Ok(())
}
