//! shardgated: the shardgate backend daemon.
//!
//! Loads the proxy configuration, warms a connection pool for every
//! configured data source, and holds the pools open until it is told to stop.
//!
//! # Usage
//!
//! ```text
//! shardgated run --config /etc/shardgate/shardgate.toml
//! shardgated check --config shardgate.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardgate_backend::PoolManager;
use shardgate_core::ProxyConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardgated", about = "shardgate backend connection daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Warm every backend pool and hold it until Ctrl-C or SIGTERM.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "shardgate.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json: bool,

        /// Pool statistics log interval in seconds (0 disables).
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Parse and validate a configuration file, then exit.
    Check {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "shardgate.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            json,
            stats_interval,
        } => {
            init_tracing(json);
            run(&config, stats_interval).await
        }
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardgate=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load(path: &Path) -> anyhow::Result<ProxyConfig> {
    ProxyConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(path: &Path, stats_interval: u64) -> anyhow::Result<()> {
    let config = load(path)?;
    let settings = config.backend_settings();
    info!(config = %path.display(), "shardgate daemon starting");

    let manager = Arc::new(PoolManager::new(Arc::new(config), settings));
    let report = manager.start().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let stats = (stats_interval > 0).then(|| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.log_stats();
            }
        })
    });

    shutdown_signal().await?;
    info!("shutdown signal received");

    if let Some(stats) = stats {
        stats.abort();
    }
    manager.stop().await?;

    info!("shardgate daemon stopped");
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let settings = config.backend_settings();
    for descriptor in config.descriptors() {
        println!(
            "{}\t{}\tcapacity={}",
            descriptor.name,
            descriptor.address(),
            settings.capacity_for(&descriptor.name)
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("installing Ctrl-C handler"),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")
}
