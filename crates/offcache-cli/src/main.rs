//! offcache - hosts the offline caching worker.
//!
//! `offcache serve` runs the worker and bridges the message protocol over
//! stdin/stdout. The other subcommands run one operation and exit.

mod bridge;
mod commands;

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offcache_core::Config;

/// Log file name prefix; the appender adds the date
const LOG_FILE_PREFIX: &str = "offcache.log";

const USAGE: &str = "\
Usage: offcache <command>

Commands:
  serve         Run the worker, exchanging JSON envelopes over stdin/stdout
  install       Pre-warm and activate the configured assets
  fetch <url>   Route one GET request and report where the answer came from
  sync          Print the current sync payload
  status        Show caches and stored records

Environment:
  RUST_LOG            Log filter (default: warn)
  OFFCACHE_ORIGIN     Origin to serve
  OFFCACHE_VERSION    Cache version identifier
  OFFCACHE_DATA_DIR   Directory for the durable store";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (stdout carries protocol traffic) and, when the log
/// directory is usable, to a daily file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir().ok().as_deref());

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    info!(command, version = %config.version, "offcache starting");

    match command {
        "serve" => bridge::serve(&config).await,
        "install" => commands::install(&config).await,
        "fetch" => {
            let url = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("fetch needs a URL\n\n{}", USAGE))?;
            commands::fetch(&config, url).await
        }
        "sync" => commands::sync(&config).await,
        "status" => commands::status(&config).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => anyhow::bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}
