//! # hubbridge
//!
//! Host process for the hub bridge. Commands arrive on stdin and replies and
//! events leave on stdout, both as length-prefixed MessagePack frames. Logs
//! go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! hubbridge
//!
//! # Run with a specific config file
//! HUBBRIDGE_CONFIG=/path/to/hubbridge.toml hubbridge
//!
//! # Verbose logging
//! HUBBRIDGE_LOG=hubbridge=trace hubbridge
//! ```

mod config;
mod dispatch;
mod metrics;
mod stdio;

use anyhow::Result;
use hubbridge_core::{ConnectionRegistry, OutboundSink};
use hubbridge_transport::{Connector, WebSocketConnector};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first: it carries the log filter.
    let config = config::Config::load()?;

    // Stdout is the host channel, so logs must go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hubbridge");

    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (sink, stream) = OutboundSink::channel();
    let connector: Arc<dyn Connector> =
        Arc::new(WebSocketConnector::new(config.websocket.to_transport_config()));
    let registry = Arc::new(ConnectionRegistry::with_config(
        connector,
        sink.clone(),
        config.registry.to_registry_config(),
    ));
    let dispatcher = dispatch::Dispatcher::new(registry, sink);

    tokio::select! {
        result = stdio::serve(dispatcher, stream, tokio::io::stdin(), tokio::io::stdout()) => {
            result?;
            info!("Host channel closed, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
        }
    }

    Ok(())
}
