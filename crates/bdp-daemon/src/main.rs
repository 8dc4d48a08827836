//! bdp-daemon - browsing-data provider daemon.
//!
//! Owns the per-domain browsing databases and serves them to browser and
//! sync processes over a private Unix socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use bdp_daemon::{server, DaemonConfig, DaemonContext};

/// Browsing-data provider daemon.
#[derive(Parser, Debug)]
#[command(name = "bdp-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML); defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on (overrides the config file).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory holding the domain databases (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `bdp_daemon=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!(
        socket = %config.socket_path.display(),
        data_dir = %config.data_dir.display(),
        "starting browsing-data provider daemon"
    );

    let ctx = Arc::new(DaemonContext::init(config)?);
    let shutdown = Arc::new(Notify::new());

    {
        let shutdown = Arc::clone(&shutdown);
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            // notify_one stores a permit, so a signal arriving before the
            // accept loop reaches its select is not lost.
            shutdown.notify_one();
        });
    }

    server::serve(ctx, shutdown).await?;
    info!("daemon stopped");
    Ok(())
}
