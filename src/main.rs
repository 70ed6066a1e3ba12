// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hub_cache_proxy::{config, server::Server};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// The main CLI application.
#[derive(Parser, Clone, Debug)]
#[clap(
    name = "hub-cache-proxy",
    about = "A caching reverse proxy in front of a model-hub content service."
)]
struct Cli {
    #[clap(long, env = "LOG_LEVEL")]
    log_level: Option<Level>,
    /// The yaml config file path.
    #[clap(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load(&cli.config).context("failed to load config")?;

    // the CLI flag (or LOG_LEVEL env var) wins over the config file's
    // log-level so an operator can bump verbosity without editing YAML.
    let log_level = match cli.log_level {
        Some(level) => level,
        None => config.log_level.parse().unwrap_or(Level::INFO),
    };
    init_tracing(log_level);

    let token = CancellationToken::new();
    shutdown_signal_listener(token.clone());

    let server = Server::new(config, token).await?;
    server.serve().await
}

/// Initialize the tracing with custom subscribers.
fn init_tracing(log_level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Set up a `CTRL+C` & `SIGTERM` handler for graceful shutdown and spawn a
/// tokio task.
fn shutdown_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let mut signal_stream = tokio::signal::unix::signal(SignalKind::terminate())
            .expect("cannot listen to SIGTERM signal");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("CTRL+C signal received, shutting down"),
            _ = signal_stream.recv() => tracing::info!("SIGTERM signal received, shutting down")
        };

        token.cancel();
    });
}
