mod cache;
mod classify;
mod commands;
mod config;
mod event;
mod lifecycle;
mod net;
mod notify;
mod proxy;
mod queue;
mod strategy;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "holdfast")]
#[command(about = "Client-resident caching and offline-resilience proxy")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/holdfast/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the durable cache/queue database (default: platform data dir)
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Stay installed-but-inactive until the host sends activate-new-version
  #[arg(long)]
  wait_for_activation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  init_logging()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let store = cache::SqliteStorage::open(args.database.as_deref())?;
  let queue = queue::SqliteQueue::open(args.database.as_deref())?;
  let fetcher = Arc::new(net::ReqwestFetcher::new(&config.origin, config.fetch_timeout())?);

  let mut proxy = proxy::Proxy::new(&config, store, queue, fetcher);
  if args.wait_for_activation {
    proxy = proxy.with_deferred_activation();
  }

  // The bridge owns stdio; everything else reaches the host through it.
  let mut bridge = event::HostBridge::new();
  proxy.run(&mut bridge).await
}

/// Log to a rolling file in the data directory. Stdout carries the host
/// protocol and must stay clean.
fn init_logging() -> Result<()> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("holdfast")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "holdfast.log");
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(appender)
    .with_ansi(false)
    .init();

  Ok(())
}
