//! Tunnel sessions.
//!
//! A session is one authenticated transport connection. It owns the stream
//! multiplexer for that connection and moves through
//! `Connecting -> Authenticated -> Active -> Draining -> Closed`.

use crate::lifecycle::Lifecycle;
use crate::registry::Name;
use crate::store::TunnelRecord;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use burrow_core::multiplex::{Frame, GoAwayReason, MuxStream, Multiplexer, Role, StreamError};
use burrow_core::{SessionId, Token};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

/// Time the writer gets to flush queued frames after the session ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticated,
            2 => SessionState::Active,
            3 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    TransportError,
    MalformedFrame,
    HeartbeatTimeout,
    ClientDisconnect,
    /// A newer session with the same token took over.
    Replaced,
    /// Token revoked or tunnel changed in the store.
    Revoked,
    Shutdown,
    /// Session never became active.
    HandshakeFailed,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::TransportError => "transport_error",
            TeardownReason::MalformedFrame => "malformed_frame",
            TeardownReason::HeartbeatTimeout => "heartbeat_timeout",
            TeardownReason::ClientDisconnect => "client_disconnect",
            TeardownReason::Replaced => "replaced",
            TeardownReason::Revoked => "revoked",
            TeardownReason::Shutdown => "shutdown",
            TeardownReason::HandshakeFailed => "handshake_failed",
        }
    }

    /// The notice sent to the client, when it is still listening.
    fn go_away(&self) -> Option<GoAwayReason> {
        match self {
            TeardownReason::Replaced => Some(GoAwayReason::Replaced),
            TeardownReason::Revoked => Some(GoAwayReason::Revoked),
            TeardownReason::Shutdown => Some(GoAwayReason::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a session authenticated as. Two sessions with equal identities are
/// the same tunnel reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub tunnel_id: i64,
    token_digest: [u8; 32],
}

impl Identity {
    pub fn new(tunnel_id: i64, token: &Token) -> Self {
        Self {
            tunnel_id,
            token_digest: token.digest(),
        }
    }
}

/// Shared handle to a session, held by the registry and the dispatcher.
pub struct SessionHandle {
    pub id: SessionId,
    pub identity: Identity,
    /// Kept for re-validation against the store.
    pub token: Token,
    /// Tunnel as resolved during the handshake.
    pub tunnel: TunnelRecord,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    state: AtomicU8,
    tcp_port: Mutex<Option<u16>>,
    mux: Arc<Multiplexer>,
    outbound: mpsc::Sender<Frame>,
    last_heartbeat: Mutex<Instant>,
    drained: Notify,
    reason: Mutex<Option<TeardownReason>>,
}

impl SessionHandle {
    /// Create a session in the `Authenticated` state. The returned receiver
    /// yields frames to write to the transport.
    pub fn new(
        token: Token,
        tunnel: TunnelRecord,
        remote_addr: SocketAddr,
        window: u32,
        max_streams: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(burrow_core::multiplex::OUTBOUND_QUEUE);
        let mux = Multiplexer::with_limits(Role::Server, outbound.clone(), window, max_streams);
        let handle = Arc::new(Self {
            id: SessionId::new(),
            identity: Identity::new(tunnel.id, &token),
            token,
            tunnel,
            remote_addr,
            connected_at: Instant::now(),
            state: AtomicU8::new(SessionState::Authenticated as u8),
            tcp_port: Mutex::new(None),
            mux,
            outbound,
            last_heartbeat: Mutex::new(Instant::now()),
            drained: Notify::new(),
            reason: Mutex::new(None),
        });
        (handle, outbound_rx)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the session may hold names: a live holder blocks other
    /// identities from binding them.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Active
        )
    }

    pub fn subdomain(&self) -> &str {
        &self.tunnel.subdomain
    }

    pub fn tcp_port(&self) -> Option<u16> {
        *self.tcp_port.lock()
    }

    pub fn set_tcp_port(&self, port: Option<u16>) {
        *self.tcp_port.lock() = port;
    }

    /// Registry names this session binds.
    pub fn names(&self) -> Vec<Name> {
        let mut names = vec![Name::Subdomain(self.tunnel.subdomain.clone())];
        if let Some(port) = self.tcp_port() {
            names.push(Name::Port(port));
        }
        names
    }

    pub fn stream_count(&self) -> usize {
        self.mux.stream_count()
    }

    /// `Authenticated -> Active`.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Authenticated as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Open a stream to the client for a public connection.
    pub async fn open_stream(&self, target_hint: Option<u16>) -> Result<MuxStream, StreamError> {
        if self.state() != SessionState::Active {
            return Err(StreamError::Closed);
        }
        self.mux.open(target_hint).await
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Move to `Draining`, abort every stream and wake the session loop.
    ///
    /// Returns `false` when the session was already draining or closed.
    pub fn begin_drain(&self, reason: TeardownReason) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= SessionState::Draining as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        *self.reason.lock() = Some(reason);
        self.mux.shutdown();
        if let Some(go_away) = reason.go_away() {
            let _ = self.outbound.try_send(Frame::GoAway { reason: go_away });
        }
        self.drained.notify_one();
        true
    }

    pub fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    /// Reason recorded by [`begin_drain`](Self::begin_drain).
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        *self.reason.lock()
    }

    async fn drained(&self) {
        self.drained.notified().await
    }

    fn send_heartbeat(&self) {
        if let Err(e) = self.outbound.try_send(Frame::Heartbeat) {
            trace!("Skipping heartbeat for session {}: {}", self.id.short(), e);
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("subdomain", &self.tunnel.subdomain)
            .field("tcp_port", &self.tcp_port())
            .field("state", &self.state())
            .finish()
    }
}

/// Drive an active session until it ends, then tear it down.
pub async fn run_session(
    handle: Arc<SessionHandle>,
    ws_tx: SplitSink<WebSocket, WsMessage>,
    mut ws_rx: SplitStream<WebSocket>,
    outbound_rx: mpsc::Receiver<Frame>,
    lifecycle: Arc<Lifecycle>,
) {
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_frames(ws_tx, outbound_rx, stop_rx));

    let heartbeat_timeout = lifecycle.heartbeat_timeout();
    let mut ticker = tokio::time::interval(lifecycle.heartbeat_interval());
    ticker.tick().await;

    let reason = loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => match Frame::decode(&data) {
                    Ok(Frame::Heartbeat) => handle.touch_heartbeat(),
                    Ok(Frame::GoAway { .. }) => break TeardownReason::ClientDisconnect,
                    Ok(frame) => {
                        if let Some(accepted) = handle.mux.handle_frame(frame).await {
                            warn!(
                                "Session {} tried to open stream {}, refusing",
                                handle.id.short(),
                                accepted.stream.id()
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Malformed frame on session {}: {}", handle.id.short(), e);
                        break TeardownReason::MalformedFrame;
                    }
                },
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("Unexpected text message on session {}", handle.id.short());
                    break TeardownReason::MalformedFrame;
                }
                Some(Ok(WsMessage::Close(_))) | None => break TeardownReason::ClientDisconnect,
                Some(Ok(_)) => {
                    // Ping/Pong are answered by axum
                }
                Some(Err(e)) => {
                    debug!("Transport error on session {}: {}", handle.id.short(), e);
                    break TeardownReason::TransportError;
                }
            },
            _ = ticker.tick() => {
                if handle.heartbeat_elapsed() > heartbeat_timeout {
                    break TeardownReason::HeartbeatTimeout;
                }
                handle.send_heartbeat();
            }
            _ = handle.drained() => {
                break handle.teardown_reason().unwrap_or(TeardownReason::Shutdown);
            }
        }
    };

    lifecycle.teardown(&handle, reason);

    let _ = stop_tx.send(());
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(
        "Session {} ({}) ended: {}",
        handle.id.short(),
        handle.subdomain(),
        reason
    );
}

/// Forward queued frames to the transport. On stop, flush what is queued and
/// close the transport.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Frame>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    return;
                }
            }
            _ = &mut stop => {
                while let Ok(frame) = outbound.try_recv() {
                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(bytes) => ws_tx.send(WsMessage::Binary(bytes)).await,
        Err(e) => {
            warn!("Dropping unencodable frame: {}", e);
            Ok(())
        }
    }
}

/// Bare session for unit tests, with the receiver of its transport queue.
#[cfg(test)]
pub(crate) fn test_session(
    tunnel_id: i64,
    token: &str,
    subdomain: &str,
) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
    let tunnel = TunnelRecord {
        id: tunnel_id,
        owner_id: tunnel_id,
        name: "Default".to_string(),
        subdomain: subdomain.to_string(),
        last_tcp_port: None,
        dynamic_forwards: vec![],
    };
    let token = Token::parse(token).expect("test token");
    SessionHandle::new(
        token,
        tunnel,
        "127.0.0.1:40000".parse().expect("test addr"),
        burrow_core::multiplex::DEFAULT_WINDOW_SIZE,
        16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let (session, _rx) = test_session(1, "tok-alice", "alice");
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.is_live());

        assert!(session.activate());
        assert!(!session.activate());
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.begin_drain(TeardownReason::Revoked));
        assert!(!session.begin_drain(TeardownReason::Shutdown));
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.teardown_reason(), Some(TeardownReason::Revoked));
        assert!(!session.is_live());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_stream_requires_active() {
        let (session, mut rx) = test_session(1, "tok-alice", "alice");
        assert!(matches!(
            session.open_stream(None).await,
            Err(StreamError::Closed)
        ));

        session.activate();
        let mut stream = session.open_stream(Some(80)).await.unwrap();
        assert_eq!(stream.id() % 2, 0);
        assert_eq!(session.stream_count(), 1);
        assert_eq!(
            rx.recv().await,
            Some(Frame::Open {
                stream_id: stream.id(),
                target_hint: Some(80)
            })
        );

        session.begin_drain(TeardownReason::Replaced);
        assert_eq!(session.stream_count(), 0);
        assert!(matches!(stream.read().await, Err(StreamError::Closed)));
        assert!(session.open_stream(None).await.is_err());
        assert_eq!(
            rx.recv().await,
            Some(Frame::GoAway {
                reason: GoAwayReason::Replaced
            })
        );
    }

    #[test]
    fn test_identity_matches_on_token_and_tunnel() {
        let (a, _) = test_session(1, "tok-alice", "alice");
        let (b, _) = test_session(1, "tok-alice", "alice");
        let (c, _) = test_session(1, "tok-other", "alice");
        assert_eq!(a.identity, b.identity);
        assert_ne!(a.identity, c.identity);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_names() {
        let (session, _rx) = test_session(1, "tok-alice", "alice");
        assert_eq!(session.names(), vec![Name::Subdomain("alice".into())]);
        session.set_tcp_port(Some(20001));
        assert_eq!(
            session.names(),
            vec![Name::Subdomain("alice".into()), Name::Port(20001)]
        );
    }
}
