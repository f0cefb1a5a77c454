//! Session lifecycle: admission, teardown and token re-validation.
//!
//! Teardown is the only path that removes names from the registry and it
//! runs at most once per session, whichever of the session loop, a
//! displacing reconnect, re-validation or shutdown gets there first.

use crate::metrics;
use crate::registry::{Name, Registry};
use crate::session::{SessionHandle, SessionState, TeardownReason};
use crate::shutdown::ShutdownSignal;
use crate::store::{StoreError, TunnelStore};
use crate::tcp::TcpDoors;
use burrow_core::SessionId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Timing knobs of the lifecycle manager.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub revalidate_interval: Duration,
}

/// Tracks live sessions and tears them down.
pub struct Lifecycle {
    registry: Arc<Registry>,
    tcp: Arc<TcpDoors>,
    store: Arc<dyn TunnelStore>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    config: LifecycleConfig,
    invalidated: Notify,
}

/// Outcome of checking one session against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Valid,
    Revoked,
    Unknown,
}

/// Summary of a live session for the status endpoint.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub tunnel_id: i64,
    pub subdomain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    pub state: String,
    pub streams: usize,
    pub remote_addr: String,
    pub connected_secs: u64,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<Registry>,
        tcp: Arc<TcpDoors>,
        store: Arc<dyn TunnelStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            tcp,
            store,
            sessions: DashMap::new(),
            config,
            invalidated: Notify::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.config.heartbeat_timeout
    }

    /// Track an active session.
    /// Track an activated session. Returns false, leaving nothing tracked,
    /// when a concurrent teardown already started draining it.
    pub fn admit(&self, session: &Arc<SessionHandle>) -> bool {
        self.sessions.insert(session.id, session.clone());
        if !session.is_live() {
            self.sessions.remove(&session.id);
            return false;
        }
        metrics::record_session_connected(session.tcp_port().is_some());
        true
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drain `session`, unbind its names and close it. Idempotent.
    pub fn teardown(&self, session: &Arc<SessionHandle>, reason: TeardownReason) {
        if !session.begin_drain(reason) {
            return;
        }

        for name in session.names() {
            if self.registry.remove(&name, session.id) {
                debug!("Unbound {} from session {}", name, session.id.short());
                if let Name::Port(port) = name {
                    self.tcp.release(port);
                }
            }
        }

        let tracked = self.sessions.remove(&session.id).is_some();
        session.mark_closed();
        if tracked {
            metrics::record_session_closed(reason.as_str(), session.connected_at.elapsed());
        }
        info!(
            "Session {} ({}) torn down: {}",
            session.id.short(),
            session.subdomain(),
            reason
        );
    }

    /// Drain every session, e.g. on shutdown.
    pub fn drain_all(&self, reason: TeardownReason) {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        info!("Draining {} sessions: {}", sessions.len(), reason);
        for session in sessions {
            self.teardown(&session, reason);
        }
    }

    /// Request an immediate re-validation of every session.
    pub fn invalidate(&self) {
        self.invalidated.notify_one();
    }

    /// Re-resolve every live session's token and tear down the ones whose
    /// tunnel is gone or moved. Returns how many were torn down.
    pub async fn revalidate_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|e| e.value().state() == SessionState::Active)
            .map(|e| e.value().clone())
            .collect();

        let mut revoked = 0;
        for session in sessions {
            match self.check(&session).await {
                Verdict::Valid => metrics::record_revalidation("valid"),
                Verdict::Unknown => metrics::record_revalidation("store_error"),
                Verdict::Revoked => {
                    metrics::record_revalidation("revoked");
                    self.teardown(&session, TeardownReason::Revoked);
                    revoked += 1;
                }
            }
        }
        revoked
    }

    async fn check(&self, session: &SessionHandle) -> Verdict {
        match self.store.resolve_token(&session.token).await {
            Ok(record)
                if record.id == session.tunnel.id
                    && record.subdomain.eq_ignore_ascii_case(session.subdomain()) =>
            {
                Verdict::Valid
            }
            Ok(record) => {
                info!(
                    "Tunnel {} now maps to {} (session {} serves {}), revoking",
                    record.id,
                    record.subdomain,
                    session.id.short(),
                    session.subdomain()
                );
                Verdict::Revoked
            }
            Err(StoreError::NotFound) => {
                info!(
                    "Token {} of session {} no longer resolves, revoking",
                    session.token.fingerprint(),
                    session.id.short()
                );
                Verdict::Revoked
            }
            Err(e) => {
                warn!(
                    "Could not re-validate session {}, keeping it: {}",
                    session.id.short(),
                    e
                );
                Verdict::Unknown
            }
        }
    }

    /// Re-validate on a fixed interval and whenever [`invalidate`](Self::invalidate)
    /// is called, until shutdown.
    pub async fn run_revalidation(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.config.revalidate_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
                _ = self.invalidated.notified() => {
                    debug!("Store invalidated, re-validating sessions");
                }
            }
            let revoked = self.revalidate_all().await;
            if revoked > 0 {
                info!("Re-validation revoked {} sessions", revoked);
            }
        }
    }

    /// Live sessions, ordered by subdomain.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|e| {
                let s = e.value();
                SessionSummary {
                    session_id: s.id,
                    tunnel_id: s.tunnel.id,
                    subdomain: s.subdomain().to_string(),
                    tcp_port: s.tcp_port(),
                    state: s.state().to_string(),
                    streams: s.stream_count(),
                    remote_addr: s.remote_addr.to_string(),
                    connected_secs: s.connected_at.elapsed().as_secs(),
                }
            })
            .collect();
        list.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        list
    }
}
