//! Prometheus metrics for the broker.
//!
//! Recording is a no-op until [`BrokerMetrics::new`] installs the global
//! recorder, so the helpers are safe to call from tests.

use axum::{routing::get, Router};
use burrow_core::multiplex::StreamStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Metrics recorder wrapper
pub struct BrokerMetrics {
    handle: PrometheusHandle,
}

impl BrokerMetrics {
    /// Install the Prometheus recorder. Fails if one is already installed.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let builder = PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0],
        )?;
        let handle = builder.install_recorder()?;
        Ok(Self { handle })
    }

    /// Render metrics in Prometheus format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a session that completed its handshake.
pub fn record_session_connected(tcp: bool) {
    counter!("burrow_sessions_connected_total", "tcp" => tcp.to_string()).increment(1);
    gauge!("burrow_active_sessions").increment(1.0);
}

/// Record a session leaving the active set.
pub fn record_session_closed(reason: &'static str, lifetime: Duration) {
    counter!("burrow_sessions_closed_total", "reason" => reason).increment(1);
    gauge!("burrow_active_sessions").decrement(1.0);
    histogram!("burrow_session_duration_seconds").record(lifetime.as_secs_f64());
}

/// Record a handshake outcome.
pub fn record_auth_attempt(success: bool) {
    if success {
        counter!("burrow_auth_success_total").increment(1);
    } else {
        counter!("burrow_auth_failure_total").increment(1);
    }
}

/// Record a name that could not be bound because another tunnel holds it.
pub fn record_bind_conflict(kind: &'static str) {
    counter!("burrow_bind_conflicts_total", "kind" => kind).increment(1);
}

/// Record a public connection that found no tunnel.
pub fn record_dispatch_miss(door: &'static str) {
    counter!("burrow_dispatch_misses_total", "door" => door).increment(1);
}

/// Record a finished relay.
pub fn record_stream_relayed(door: &'static str, stats: StreamStats, duration: Duration) {
    counter!("burrow_streams_total", "door" => door).increment(1);
    counter!("burrow_bytes_out_total", "door" => door).increment(stats.bytes_sent);
    counter!("burrow_bytes_in_total", "door" => door).increment(stats.bytes_received);
    histogram!("burrow_stream_duration_seconds", "door" => door).record(duration.as_secs_f64());
}

/// Record a relay that ended abnormally.
pub fn record_stream_aborted(door: &'static str, cause: &'static str) {
    counter!("burrow_streams_aborted_total", "door" => door, "cause" => cause).increment(1);
}

/// Record the outcome of one token re-validation.
pub fn record_revalidation(outcome: &'static str) {
    counter!("burrow_revalidations_total", "outcome" => outcome).increment(1);
}

/// Set the number of open public TCP ports.
pub fn set_open_tcp_ports(count: usize) {
    gauge!("burrow_open_tcp_ports").set(count as f64);
}

/// Router serving the /metrics endpoint.
pub fn metrics_router<S>(metrics: Arc<BrokerMetrics>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }),
    )
}
