//! VRT daemon
//!
//! Opens the store and runs the periodic sweep.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vrt_daemon::{AppState, DaemonConfig, Sweeper};

#[derive(Parser)]
#[command(name = "vrtd")]
#[command(about = "VRT daemon - visual regression baselines and cleanup")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Sweep once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("VRT daemon v{}", vrt_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(|| vrt_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    tokio::fs::create_dir_all(&config.store_path).await?;

    let (state, images, _events) = AppState::open(&config).await?;
    let sweeper = Sweeper::new(state, images, config.sweep.clone());

    if cli.once {
        let report = sweeper.sweep_once().await?;
        info!(
            "Sweep removed {} stale variations{}",
            report.variations_removed,
            report
                .gc
                .map(|gc| format!(", {} images", gc.deleted_images))
                .unwrap_or_default()
        );
        return Ok(());
    }

    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

    info!("Daemon started with store {:?}", config.store_path);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = sweeper_handle => {
            if let Err(e) = result {
                error!("Sweeper error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
