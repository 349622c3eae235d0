// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Sync Daemon
//!
//! The `aegis-sync` binary wires the continuous-synchronization backbone from
//! a `SyncConfig` manifest: provider discovery, circuit breakers, per-domain
//! rate limiting and one ingestion pipeline per configured resource kind.
//! It runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

mod daemon;

use aegis_sync_core::domain::sync_config::{LoggingConfig, SyncConfigManifest};

/// AEGIS Sync - Keep the knowledge store in step with upstream providers
#[derive(Parser)]
#[command(name = "aegis-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, env = "AEGIS_SYNC_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AEGIS_SYNC_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SyncConfigManifest::load_or_default(cli.config)
        .context("Failed to load configuration")?;

    let logging = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.logging.clone());
    init_logging(cli.log_level.as_deref(), logging.as_ref())?;

    daemon::run(config).await
}

/// Initialize tracing subscriber for logging
///
/// `RUST_LOG` wins over `--log-level`, which wins over the manifest.
fn init_logging(cli_level: Option<&str>, logging: Option<&LoggingConfig>) -> Result<()> {
    let level = cli_level
        .map(str::to_string)
        .or_else(|| logging.map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match logging.map(|l| l.format.as_str()) {
        Some("json") => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
