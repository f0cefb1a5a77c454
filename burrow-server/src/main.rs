//! burrowd - reverse-tunnel broker.
//!
//! Accepts tunnel clients on the control port and routes public HTTP and TCP
//! connections to them.

mod config;
mod db;
mod dispatch;
mod hotreload;
mod lifecycle;
mod metrics;
mod proxy;
mod registry;
mod session;
mod shutdown;
mod store;
mod tcp;
mod tunnel;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::ServerConfig;
use session::TeardownReason;
use shutdown::GracefulShutdown;
use std::sync::Arc;
use store::{MemoryStore, TunnelStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    config.validate().map_err(|e| anyhow!(e))?;

    info!("Starting burrowd v{}", env!("CARGO_PKG_VERSION"));
    info!("Domain: {}", config.domain);
    info!("Control port: {}", config.control_port);
    info!("HTTP port: {}", config.http_port);
    info!(
        "TCP ports: {}-{}",
        config.tcp_port_start, config.tcp_port_end
    );

    let graceful = GracefulShutdown::new(config.shutdown_timeout());
    let shutdown = graceful.signal();

    let mut file_store = None;
    let store: Arc<dyn TunnelStore> = if let Some(url) = &config.database_url {
        let db = db::PgTunnelStore::connect(&db::DbConfig::new(url.clone()))
            .await
            .context("connecting to the tunnel database")?;
        Arc::new(db)
    } else if let Some(path) = &config.tunnels_file {
        let store = Arc::new(
            MemoryStore::load(path)
                .with_context(|| format!("loading tunnels file {}", path.display()))?,
        );
        file_store = Some(store.clone());
        store
    } else {
        warn!("No --database-url or --tunnels-file given, every token will be rejected");
        Arc::new(MemoryStore::new())
    };

    let broker = tunnel::Broker::new(config.clone(), store, shutdown.clone())
        .map_err(|e| anyhow!("{}", e))?;

    let mut control_app = tunnel::control_router(broker.clone());
    match metrics::BrokerMetrics::new() {
        Ok(m) => control_app = control_app.merge(metrics::metrics_router(Arc::new(m))),
        Err(e) => warn!("Metrics disabled: {}", e),
    }

    let _watcher = match file_store {
        Some(store) => Some(
            hotreload::start_watcher(
                store,
                broker.lifecycle.clone(),
                hotreload::DEFAULT_DEBOUNCE,
            )
            .context("watching the tunnels file")?,
        ),
        None => None,
    };

    let control_listener = TcpListener::bind((config.bind.as_str(), config.control_port))
        .await
        .with_context(|| format!("binding control port {}", config.control_port))?;
    let http_listener = TcpListener::bind((config.bind.as_str(), config.http_port))
        .await
        .with_context(|| format!("binding HTTP port {}", config.http_port))?;

    let control_shutdown = shutdown.clone();
    let control_handle = tokio::spawn(async move {
        if let Err(e) =
            tunnel::run_control_server(control_listener, control_app, control_shutdown).await
        {
            error!("Control server error: {}", e);
        }
    });

    let http_door = broker.http_door();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy::run_proxy_server(http_listener, http_door).await {
            error!("HTTP front door error: {}", e);
        }
    });

    tokio::spawn(
        broker
            .lifecycle
            .clone()
            .run_revalidation(shutdown.clone()),
    );

    info!("Broker is ready to accept connections");

    graceful.wait_for_signal().await;
    broker.lifecycle.drain_all(TeardownReason::Shutdown);
    if !graceful.shutdown().await {
        warn!("Closing with public connections still open");
    }

    control_handle.abort();
    proxy_handle.abort();
    info!("Shutdown complete");
    Ok(())
}
