//! gsetd - replicated grow-only set node
//!
//! Speaks the Maelstrom protocol on stdin/stdout: one JSON message per line.
//! Logs go to stderr.

use clap::Parser;
use gsetd::config::Config;
use gsetd::server::Node;
use gset_net::StdioTransport;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("gsetd={default_level},gset_net={default_level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("gsetd v{} - replicated grow-only set", env!("CARGO_PKG_VERSION"));

    let (transport, inbox) = match StdioTransport::bootstrap(config.inbox_capacity).await {
        Ok(bootstrapped) => bootstrapped,
        Err(e) => {
            error!("Init handshake failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::new(config, transport) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to initialize node: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    let signal_node = Arc::clone(&node);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_node.shutdown();
        }
    });

    if let Err(e) = node.run(inbox).await {
        error!("Node error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
