//! Broker connection, stream forwarding and reconnection.

use crate::config::{ClientConfig, ForwardTargets};
use burrow_core::multiplex::{Accepted, OUTBOUND_QUEUE};
use burrow_core::relay::relay;
use burrow_core::{
    DynamicForward, Frame, GoAwayReason, Handshake, Multiplexer, Role, SessionId, TunnelError,
    TunnelResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the broker granted in its welcome.
#[derive(Debug)]
struct Grant {
    session_id: SessionId,
    url: String,
    tcp_port: Option<u16>,
    dynamic_forwards: Vec<DynamicForward>,
    heartbeat_interval: Duration,
}

/// Run the tunnel with automatic reconnection.
///
/// Returns when the broker ends the tunnel for good (replaced or revoked),
/// on a rejection that retrying cannot fix, or once `max_reconnects`
/// consecutive attempts have failed.
pub async fn run_tunnel_loop(config: &ClientConfig) -> TunnelResult<()> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match run_tunnel(config, &mut attempts).await {
            Ok(GoAwayReason::Replaced) => {
                info!("Another client took over this tunnel, exiting");
                return Ok(());
            }
            Ok(GoAwayReason::Revoked) => {
                return Err(TunnelError::auth("tunnel was revoked by the broker"));
            }
            Ok(GoAwayReason::Shutdown) => {
                info!("Broker is shutting down");
            }
            Err(e) if !e.is_retryable() => {
                error!("Tunnel error: {}", e);
                return Err(e);
            }
            Err(e) => {
                error!("Tunnel error: {}", e);
                if config.max_reconnects > 0 && attempts >= config.max_reconnects {
                    error!("Max reconnect attempts ({}) reached", config.max_reconnects);
                    return Err(e);
                }
            }
        }

        info!(
            "Reconnecting in {} seconds... (attempt {})",
            config.reconnect_delay,
            attempts + 1
        );
        tokio::time::sleep(config.reconnect_delay()).await;
    }
}

/// Run a single tunnel connection until the broker ends it.
async fn run_tunnel(config: &ClientConfig, attempts: &mut u32) -> TunnelResult<GoAwayReason> {
    let url = config.ws_url();
    info!("Connecting to {}", url);

    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TunnelError::transport("cannot reach broker").with_cause(e))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello = Handshake::hello(config.token.clone(), config.tcp)
        .to_json()
        .map_err(|e| TunnelError::internal("cannot encode hello").with_cause(e))?;
    ws_tx
        .send(WsMessage::Text(hello))
        .await
        .map_err(|e| TunnelError::transport("cannot send hello").with_cause(e))?;

    let grant = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_welcome(&mut ws_rx))
        .await
        .map_err(|_| TunnelError::timeout("no handshake reply from broker"))??;

    *attempts = 0;
    info!("Connected! Session {}", grant.session_id.short());
    info!("Your tunnel is live at: {}", grant.url);
    if let Some(port) = grant.tcp_port {
        info!("Public TCP port: {}", port);
    }

    let targets = config.targets(&grant.dynamic_forwards);
    info!("Forwarding to {}", targets.default_target());

    run_session(config, grant, targets, ws_tx, ws_rx).await
}

async fn read_welcome(ws_rx: &mut SplitStream<Ws>) -> TunnelResult<Grant> {
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(TunnelError::transport("handshake failed").with_cause(e));
            }
            None => return Err(TunnelError::transport("closed during handshake")),
        };

        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return Err(TunnelError::transport("closed during handshake")),
            WsMessage::Binary(_) => {
                return Err(TunnelError::malformed("frame before welcome"));
            }
            _ => continue,
        };

        return match Handshake::from_json(text.as_bytes()) {
            Ok(Handshake::Welcome {
                session_id,
                url,
                tcp_port,
                dynamic_forwards,
                heartbeat_interval_secs,
                ..
            }) => Ok(Grant {
                session_id,
                url,
                tcp_port,
                dynamic_forwards,
                heartbeat_interval: Duration::from_secs(heartbeat_interval_secs.max(1)),
            }),
            Ok(Handshake::Rejected { code, message }) => {
                Err(TunnelError::from(code).with_context("reason", message))
            }
            Ok(Handshake::Hello { .. }) => Err(TunnelError::malformed("unexpected hello")),
            Err(e) => Err(TunnelError::malformed("unparseable handshake reply").with_cause(e)),
        };
    }
}

/// Serve streams opened by the broker until the session ends.
async fn run_session(
    config: &ClientConfig,
    grant: Grant,
    targets: ForwardTargets,
    ws_tx: SplitSink<Ws, WsMessage>,
    mut ws_rx: SplitStream<Ws>,
) -> TunnelResult<GoAwayReason> {
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_frames(ws_tx, frame_rx, stop_rx));
    let mux = Multiplexer::new(Role::Client, frame_tx.clone());

    let heartbeat_timeout = grant.heartbeat_interval * config.heartbeat_misses.max(1);
    let mut ticker = tokio::time::interval(grant.heartbeat_interval);
    ticker.tick().await;
    let mut last_heartbeat = Instant::now();

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => match Frame::decode(&data) {
                    Ok(Frame::Heartbeat) => last_heartbeat = Instant::now(),
                    Ok(Frame::GoAway { reason }) => break Ok(reason),
                    Ok(frame) => {
                        if let Some(accepted) = mux.handle_frame(frame).await {
                            forward_stream(accepted, &targets, config.stream_idle_timeout());
                        }
                    }
                    Err(e) => {
                        break Err(TunnelError::malformed("undecodable frame from broker").with_cause(e));
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    break Err(TunnelError::transport("broker closed the connection"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(TunnelError::transport("connection lost").with_cause(e)),
            },
            _ = ticker.tick() => {
                if last_heartbeat.elapsed() > heartbeat_timeout {
                    break Err(TunnelError::timeout("broker stopped sending heartbeats"));
                }
                if frame_tx.try_send(Frame::Heartbeat).is_err() {
                    debug!("Outbound queue full, skipping heartbeat");
                }
            }
        }
    };

    mux.shutdown();
    let _ = stop_tx.send(());
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    result
}

/// Connect the stream to its local target and relay until either side ends.
fn forward_stream(accepted: Accepted, targets: &ForwardTargets, idle_timeout: Duration) {
    let target = targets.select(accepted.target_hint).to_string();
    let stream = accepted.stream;
    tokio::spawn(async move {
        let id = stream.id();
        let socket = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!("Stream {}: cannot connect to {}: {}", id, target, e);
                return;
            }
            Err(_) => {
                warn!("Stream {}: connecting to {} timed out", id, target);
                return;
            }
        };

        debug!("Stream {} -> {}", id, target);
        match relay(stream, socket, idle_timeout).await {
            Ok(stats) => debug!(
                "Stream {} done ({} bytes out, {} bytes in)",
                id, stats.bytes_sent, stats.bytes_received
            ),
            Err(e) => debug!("Stream {} ended: {}", id, e),
        }
    });
}

/// Forward queued frames to the broker. On stop, flush what is queued and
/// close the connection.
async fn write_frames(
    mut ws_tx: SplitSink<Ws, WsMessage>,
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
    ws_tx: &mut SplitSink<Ws, WsMessage>,
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match frame.encode() {
        Ok(bytes) => ws_tx.send(WsMessage::Binary(bytes)).await,
        Err(e) => {
            warn!("Dropping unencodable frame: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::{ErrorCategory, RejectCode};
    use clap::Parser;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    fn client_config(server: SocketAddr, forward: &str) -> ClientConfig {
        let server = server.to_string();
        ClientConfig::parse_from([
            "burrow",
            "--server",
            server.as_str(),
            "--token",
            "tok-alice",
            "--forward",
            forward,
            "--reconnect-delay",
            "0",
        ])
    }

    fn welcome() -> Handshake {
        Handshake::Welcome {
            session_id: SessionId::new(),
            subdomain: "alice".to_string(),
            url: "http://alice.example.com".to_string(),
            tcp_port: None,
            dynamic_forwards: vec![],
            heartbeat_interval_secs: 15,
        }
    }

    /// Accept one client, check its hello and answer with `reply`.
    async fn accept_client(listener: &TcpListener, reply: &Handshake) -> ServerWs {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(socket).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => match Handshake::from_json(text.as_bytes()).unwrap() {
                Handshake::Hello { token, .. } => assert_eq!(token, "tok-alice"),
                other => panic!("expected hello, got {:?}", other),
            },
            other => panic!("expected text, got {:?}", other),
        }
        ws.send(WsMessage::Text(reply.to_json().unwrap()))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut ServerWs, frame: Frame) {
        ws.send(WsMessage::Binary(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    async fn next_frame(ws: &mut ServerWs) -> Frame {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => match Frame::decode(&data).unwrap() {
                    Frame::Heartbeat => continue,
                    frame => return frame,
                },
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap(), "3000");

        let broker = tokio::spawn(async move {
            let reply = Handshake::rejected(RejectCode::Unauthorized, "unknown token");
            let _ws = accept_client(&listener, &reply).await;
        });

        let err = run_tunnel_loop(&config).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Authentication);
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_max_reconnects_on_retryable_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = client_config(listener.local_addr().unwrap(), "3000");
        config.max_reconnects = 2;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        tokio::spawn(async move {
            let reply = Handshake::rejected(RejectCode::Unavailable, "too many sessions");
            loop {
                let _ws = accept_client(&listener, &reply).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let err = run_tunnel_loop(&config).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Unavailable);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_reconnects_and_replaced_exits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap(), "3000");

        let broker = tokio::spawn(async move {
            let mut ws = accept_client(&listener, &welcome()).await;
            send(
                &mut ws,
                Frame::GoAway {
                    reason: GoAwayReason::Shutdown,
                },
            )
            .await;

            let mut ws = accept_client(&listener, &welcome()).await;
            send(
                &mut ws,
                Frame::GoAway {
                    reason: GoAwayReason::Replaced,
                },
            )
            .await;
        });

        run_tunnel_loop(&config).await.unwrap();
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_stream_is_relayed_to_target() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            socket.write_all(b"world").await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap(), &upstream_addr.to_string());

        let broker = tokio::spawn(async move {
            let mut ws = accept_client(&listener, &welcome()).await;
            send(
                &mut ws,
                Frame::Open {
                    stream_id: 2,
                    target_hint: Some(80),
                },
            )
            .await;
            send(
                &mut ws,
                Frame::Data {
                    stream_id: 2,
                    payload: b"hello".to_vec(),
                },
            )
            .await;

            let mut echoed = Vec::new();
            while echoed.len() < 5 {
                match next_frame(&mut ws).await {
                    Frame::Data { stream_id, payload } => {
                        assert_eq!(stream_id, 2);
                        echoed.extend_from_slice(&payload);
                    }
                    Frame::WindowUpdate { .. } => {}
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            assert_eq!(echoed, b"world");

            send(
                &mut ws,
                Frame::GoAway {
                    reason: GoAwayReason::Replaced,
                },
            )
            .await;
        });

        run_tunnel_loop(&config).await.unwrap();
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_revoked_ends_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = client_config(listener.local_addr().unwrap(), "3000");

        tokio::spawn(async move {
            let mut ws = accept_client(&listener, &welcome()).await;
            send(
                &mut ws,
                Frame::GoAway {
                    reason: GoAwayReason::Revoked,
                },
            )
            .await;
            // Keep the transport open until the client leaves.
            while ws.next().await.is_some() {}
        });

        let err = run_tunnel_loop(&config).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
