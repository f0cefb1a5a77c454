//! burrow - tunnel client.
//!
//! Runs next to a local service and exposes it through a burrow broker.

mod config;
mod health;
mod tunnel;

use anyhow::{anyhow, Result};
use clap::Parser;
use config::ClientConfig;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();

    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    info!("Starting burrow v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.server);
    info!("Forward: {}", config.forward);
    for forward in &config.dynamic_forwards {
        info!("  port {} -> {}", forward.port, forward.target);
    }

    if config.verify_upstream {
        if let Err(e) = health::verify_upstream(&config.forward, 5).await {
            if config.require_upstream {
                return Err(anyhow!(
                    "Upstream service at {} is not reachable ({}). \
                     Start the local service first or drop --require-upstream",
                    config.forward,
                    e
                ));
            }
            warn!("Continuing without a reachable upstream");
        }
    }

    tokio::select! {
        result = tunnel::run_tunnel_loop(&config) => result.map_err(|e| anyhow!("{}", e)),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing tunnel");
            Ok(())
        }
    }
}
