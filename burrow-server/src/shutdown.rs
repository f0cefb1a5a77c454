//! Graceful shutdown with public connection draining.
//!
//! On shutdown the listeners stop accepting, every session is drained with a
//! `shutdown` notice, and in-flight public connections get a bounded amount
//! of time to finish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown signal that can be shared across tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    /// Flag indicating shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
    /// Broadcast sender for shutdown notification.
    notify: broadcast::Sender<()>,
    /// Counter for in-flight public connections.
    active_connections: Arc<AtomicUsize>,
    /// Time in-flight connections get to finish.
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new(timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            active_connections: Arc::new(AtomicUsize::new(0)),
            timeout,
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn initiate_shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.notify.send(());
        info!("Shutdown initiated");
    }

    /// Resolve once shutdown has been initiated, including before the call.
    pub async fn wait(&self) {
        let mut rx = self.notify.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Register an in-flight public connection.
    pub fn register_connection(&self) -> ConnectionGuard {
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Connection registered, active: {}", active);
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Wait for all connections to drain with timeout.
    pub async fn wait_for_drain(&self) -> bool {
        info!(
            "Waiting for {} active connections to drain (timeout: {:?})",
            self.active_connection_count(),
            self.timeout
        );

        let drain_future = async {
            loop {
                let count = self.active_connection_count();
                if count == 0 {
                    info!("All connections drained successfully");
                    return true;
                }
                debug!("Waiting for {} connections to drain", count);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        match timeout(self.timeout, drain_future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Shutdown timeout reached with {} connections still active",
                    self.active_connection_count()
                );
                false
            }
        }
    }
}

/// Guard that decrements the connection counter when dropped.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!("Connection closed, active: {}", prev.saturating_sub(1));
    }
}

/// Graceful shutdown coordinator.
pub struct GracefulShutdown {
    signal: ShutdownSignal,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        Self {
            signal: ShutdownSignal::new(timeout),
        }
    }

    /// Get the shutdown signal for sharing with tasks.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Wait for Ctrl+C or SIGTERM, then initiate shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = self.signal.wait() => {}
        }

        self.signal.initiate_shutdown();
    }

    /// Wait for in-flight connections. Returns false on timeout.
    pub async fn shutdown(&self) -> bool {
        self.signal.wait_for_drain().await
    }
}
