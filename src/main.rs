// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use log_aggregator::config::{load_config_with_env, LoggingConfig};
use log_aggregator::counters::{CounterSink, CountersPublisher, HttpCounterSink, LogCounterSink};
use log_aggregator::handler::LogHandler;
use log_aggregator::server;

/// Log aggregator - route categorized log messages to files, peers and buffers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Resolves on SIGINT or SIGTERM; SIGHUP reloads the configuration meanwhile
async fn wait_for_shutdown(handler: Arc<LogHandler>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot install SIGHUP handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = handler.reinitialize().await {
                        error!("Reload failed: {}", e);
                    }
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    return;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = handler;
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    init_tracing(&config.logging)?;

    info!("Starting log aggregator {}", log_aggregator::protocol::VERSION);
    info!("Loaded configuration from: {:?}", args.config);

    let listen = config.server.listen.clone();
    let counters_interval = config.aggregator.counters_interval();
    let publish_url = config.aggregator.counters_publish_url.clone();

    let handler = Arc::new(LogHandler::new(Some(args.config.clone())));
    let report = handler
        .initialize(config)
        .await
        .context("Failed to apply initial configuration")?;
    info!(
        "Routing {} categories, {} prefixes, default: {}",
        report.categories, report.prefixes, report.has_default
    );

    // Counters publisher
    let sink: Arc<dyn CounterSink> = match publish_url {
        Some(url) => Arc::new(HttpCounterSink::new(url)?),
        None => Arc::new(LogCounterSink),
    };
    let (publisher_tx, publisher_rx) = watch::channel(false);
    let publisher =
        CountersPublisher::new(handler.counters_handle(), sink, counters_interval).spawn(publisher_rx);

    // Serve until a shutdown signal arrives
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    server::serve(listener, handler.clone(), wait_for_shutdown(handler.clone())).await?;

    // Cleanup
    handler.shutdown().await;
    let _ = publisher_tx.send(true);
    if let Err(e) = publisher.await {
        error!("Counters publisher failed: {}", e);
    }

    info!("Log aggregator shut down successfully");
    Ok(())
}
