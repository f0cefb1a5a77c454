//! Broker state and the WebSocket control server.
//!
//! Tunnel clients connect to `/ws`, present a token in a `hello`, and are
//! either welcomed with their bound names or rejected with a reason code.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::lifecycle::{Lifecycle, LifecycleConfig, SessionSummary};
use crate::metrics;
use crate::proxy::HttpDoor;
use crate::registry::{Name, Registry, RegistryError};
use crate::session::{run_session, SessionHandle, TeardownReason};
use crate::shutdown::ShutdownSignal;
use crate::store::TunnelStore;
use crate::tcp::TcpDoors;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use burrow_core::multiplex::Frame;
use burrow_core::protocol::{is_valid_subdomain, PROTOCOL_VERSION};
use burrow_core::{ErrorCategory, Handshake, Token, TunnelError, TunnelResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the listeners share.
pub struct Broker {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn TunnelStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub tcp: Arc<TcpDoors>,
    pub lifecycle: Arc<Lifecycle>,
    pub shutdown: ShutdownSignal,
}

impl Broker {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn TunnelStore>,
        shutdown: ShutdownSignal,
    ) -> TunnelResult<Arc<Self>> {
        let bind_ip: IpAddr = config.bind.parse().map_err(|e| {
            TunnelError::config(format!("invalid bind address {:?}", config.bind)).with_cause(e)
        })?;

        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.stream_idle_timeout(),
        ));
        let tcp = Arc::new(TcpDoors::new(
            bind_ip,
            config.tcp_port_range(),
            registry.clone(),
            dispatcher.clone(),
            shutdown.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            registry.clone(),
            tcp.clone(),
            store.clone(),
            LifecycleConfig {
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
                revalidate_interval: config.revalidate_interval(),
            },
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            store,
            dispatcher,
            tcp,
            lifecycle,
            shutdown,
        }))
    }

    /// Settings for the HTTP front door.
    pub fn http_door(&self) -> Arc<HttpDoor> {
        Arc::new(HttpDoor {
            domain: self.config.domain.clone(),
            http_port: self.config.http_port,
            dispatcher: self.dispatcher.clone(),
            shutdown: self.shutdown.clone(),
        })
    }
}

/// Routes of the control port.
pub fn control_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(broker)
}

/// Serve the control port until shutdown.
pub async fn run_control_server(
    listener: TcpListener,
    app: Router,
    shutdown: ShutdownSignal,
) -> Result<()> {
    info!("Control server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.wait().await })
    .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatusResponse {
    active_sessions: usize,
    bound_names: usize,
    tcp_ports: Vec<u16>,
    sessions: Vec<SessionSummary>,
}

async fn status_handler(State(broker): State<Arc<Broker>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active_sessions: broker.lifecycle.session_count(),
        bound_names: broker.registry.len(),
        tcp_ports: broker.tcp.open_ports(),
        sessions: broker.lifecycle.summaries(),
    })
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(broker): State<Arc<Broker>>,
) -> Response {
    if broker.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Broker is shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_tunnel_connection(socket, remote_addr, broker))
}

async fn handle_tunnel_connection(socket: WebSocket, remote_addr: SocketAddr, broker: Arc<Broker>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let hello = tokio::time::timeout(broker.config.auth_timeout(), read_hello(&mut ws_rx))
        .await
        .unwrap_or_else(|_| Err(TunnelError::timeout("no hello before the auth timeout")));

    let admitted = match hello {
        Ok((token, tcp)) => {
            let fingerprint = token.fingerprint();
            authenticate(&broker, token, tcp, remote_addr)
                .await
                .map_err(|e| e.with_context("token", fingerprint))
        }
        Err(e) => Err(e),
    };

    let (session, outbound_rx) = match admitted {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!("Handshake from {} rejected: {}", remote_addr, e);
            metrics::record_auth_attempt(false);
            reject(&mut ws_tx, &e).await;
            return;
        }
    };
    metrics::record_auth_attempt(true);

    let welcome = Handshake::Welcome {
        session_id: session.id,
        subdomain: session.subdomain().to_string(),
        url: broker.config.tunnel_url(session.subdomain()),
        tcp_port: session.tcp_port(),
        dynamic_forwards: session.tunnel.dynamic_forwards.clone(),
        heartbeat_interval_secs: broker.config.heartbeat_interval,
    };
    if let Err(e) = send_handshake(&mut ws_tx, &welcome).await {
        debug!("Sending welcome to {} failed: {}", remote_addr, e);
        broker
            .lifecycle
            .teardown(&session, TeardownReason::TransportError);
        return;
    }

    info!(
        "Session {} connected from {}: {}{}",
        session.id.short(),
        remote_addr,
        broker.config.tunnel_url(session.subdomain()),
        session
            .tcp_port()
            .map(|p| format!(" (tcp port {})", p))
            .unwrap_or_default()
    );

    run_session(session, ws_tx, ws_rx, outbound_rx, broker.lifecycle.clone()).await;
}

/// Wait for the client's `hello`.
async fn read_hello(ws_rx: &mut SplitStream<WebSocket>) -> TunnelResult<(Token, bool)> {
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(TunnelError::transport("transport failed").with_cause(e)),
            None => return Err(TunnelError::transport("closed before hello")),
        };

        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => return Err(TunnelError::transport("closed before hello")),
            WsMessage::Binary(_) => return Err(TunnelError::malformed("expected a hello message")),
        };

        return match Handshake::from_json(text.as_bytes()) {
            Ok(Handshake::Hello {
                version,
                token,
                tcp,
            }) => {
                if version != PROTOCOL_VERSION {
                    return Err(TunnelError::protocol(format!(
                        "protocol version {} is not supported, expected {}",
                        version, PROTOCOL_VERSION
                    )));
                }
                let token = Token::parse(&token)
                    .map_err(|e| TunnelError::auth("invalid token").with_cause(e))?;
                Ok((token, tcp))
            }
            Ok(_) => Err(TunnelError::malformed("expected a hello message")),
            Err(e) => Err(TunnelError::malformed("unparseable hello").with_cause(e)),
        };
    }
}

/// Resolve the token, bind the tunnel's names and activate a new session.
///
/// A live session with the same identity is displaced; a live session of a
/// different identity on the subdomain makes the handshake fail.
async fn authenticate(
    broker: &Broker,
    token: Token,
    tcp: bool,
    remote_addr: SocketAddr,
) -> TunnelResult<(Arc<SessionHandle>, mpsc::Receiver<Frame>)> {
    if broker.lifecycle.session_count() >= broker.config.max_sessions {
        return Err(TunnelError::unavailable("broker is at capacity"));
    }

    let mut record = broker.store.resolve_token(&token).await?;
    record.subdomain = record.subdomain.to_ascii_lowercase();
    if !is_valid_subdomain(&record.subdomain) {
        return Err(TunnelError::config(format!(
            "tunnel {} has an invalid subdomain",
            record.id
        )));
    }
    let tunnel_id = record.id;
    let previous_port = record.last_tcp_port;

    let (session, outbound_rx) = SessionHandle::new(
        token,
        record,
        remote_addr,
        broker.config.stream_window,
        broker.config.max_streams,
    );

    // Displaced sessions are torn down only once every claim went through;
    // until then the old session's port listener is reused as is.
    let mut displaced = Vec::new();

    let subdomain = Name::Subdomain(session.subdomain().to_string());
    match broker.registry.claim(subdomain.clone(), &session) {
        Ok(old) => displaced.extend(old),
        Err(RegistryError::Conflict { holder, .. }) => {
            metrics::record_bind_conflict("subdomain");
            return Err(TunnelError::bind_conflict(format!(
                "{} is served by another client",
                subdomain
            ))
            .with_context("holder", holder.id.short()));
        }
        Err(e) => return Err(TunnelError::unavailable(e.to_string())),
    }

    let mut allocated_port = None;
    if tcp {
        match broker.tcp.claim_port(&session, previous_port) {
            Ok((port, old)) => {
                displaced.extend(old);
                allocated_port = Some(port).filter(|p| previous_port != Some(*p));
            }
            Err(e) => {
                broker
                    .lifecycle
                    .teardown(&session, TeardownReason::HandshakeFailed);
                retire(broker, displaced, &session);
                return Err(e);
            }
        }
    }

    // A newer reconnect may have displaced this session in the meantime.
    if !session.activate() || !broker.lifecycle.admit(&session) {
        broker
            .lifecycle
            .teardown(&session, TeardownReason::HandshakeFailed);
        retire(broker, displaced, &session);
        return Err(TunnelError::unavailable("session replaced during handshake"));
    }
    retire(broker, displaced, &session);

    if let Some(port) = allocated_port {
        if let Err(e) = broker.store.persist_allocated_port(tunnel_id, port).await {
            warn!(
                "Could not remember port {} for tunnel {}: {}",
                port, tunnel_id, e
            );
        }
    }
    if !session.is_live() {
        return Err(TunnelError::unavailable("session replaced during handshake"));
    }
    Ok((session, outbound_rx))
}

/// Tear down the sessions a handshake displaced, once each.
fn retire(broker: &Broker, displaced: Vec<Arc<SessionHandle>>, new: &SessionHandle) {
    let mut seen = HashSet::new();
    for old in displaced {
        if seen.insert(old.id) {
            displace(broker, &old, new);
        }
    }
}

fn displace(broker: &Broker, old: &Arc<SessionHandle>, new: &SessionHandle) {
    info!(
        "Session {} ({}) replaced by {}",
        old.id.short(),
        old.subdomain(),
        new.id.short()
    );
    broker.lifecycle.teardown(old, TeardownReason::Replaced);
}

async fn send_handshake(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    message: &Handshake,
) -> TunnelResult<()> {
    let json = message
        .to_json()
        .map_err(|e| TunnelError::internal("cannot encode handshake").with_cause(e))?;
    ws_tx
        .send(WsMessage::Text(json))
        .await
        .map_err(|e| TunnelError::transport("cannot send handshake").with_cause(e))
}

/// Tell the client why it was refused, then close.
async fn reject(ws_tx: &mut SplitSink<WebSocket, WsMessage>, err: &TunnelError) {
    let message = match err.category {
        ErrorCategory::Store => "store unavailable".to_string(),
        _ => err.message.clone(),
    };
    let rejected = Handshake::rejected(err.reject_code(), message);
    if let Err(e) = send_handshake(ws_tx, &rejected).await {
        debug!("Could not deliver rejection: {}", e);
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
}
