//! Upstream reachability check.
//!
//! Checks that the forward target accepts TCP connections before the tunnel
//! goes live, so a misconfigured `--forward` shows up at startup instead of
//! as failed public requests.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Health check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Service is accepting connections.
    Healthy,
    /// Service refused or did not answer.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a single check.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

/// Try one TCP connection to `addr` (any `host:port`, names are resolved).
pub async fn check_tcp(addr: &str, connect_timeout: Duration) -> HealthCheckResult {
    let start = Instant::now();
    let outcome = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("Connection failed: {}", e)),
        Err(_) => Err("Connection timeout".to_string()),
    };

    match outcome {
        Ok(()) => {
            let latency = start.elapsed();
            debug!("Health check passed for {} (latency: {:?})", addr, latency);
            HealthCheckResult {
                status: HealthStatus::Healthy,
                latency: Some(latency),
                error: None,
            }
        }
        Err(e) => {
            debug!("Health check failed for {}: {}", addr, e);
            HealthCheckResult {
                status: HealthStatus::Unhealthy,
                latency: None,
                error: Some(e),
            }
        }
    }
}

/// Verify upstream connectivity before starting the tunnel.
pub async fn verify_upstream(addr: &str, timeout_secs: u64) -> Result<Duration, String> {
    info!("Verifying upstream connectivity to {}...", addr);

    let result = check_tcp(addr, Duration::from_secs(timeout_secs)).await;
    match result.status {
        HealthStatus::Healthy => {
            let latency = result.latency.unwrap_or_default();
            info!("Upstream {} is reachable (latency: {:?})", addr, latency);
            Ok(latency)
        }
        HealthStatus::Unhealthy => {
            let err = result.error.unwrap_or_else(|| "Unknown error".to_string());
            error!("Upstream {} is not reachable: {}", addr, err);
            Err(err)
        }
    }
}
