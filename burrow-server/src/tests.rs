//! End-to-end broker scenarios over real sockets.
//!
//! Each test starts the control server and the HTTP front door on ephemeral
//! ports and drives them with a scripted tunnel client built from the core
//! multiplexer and relay.

use crate::config::ServerConfig;
use crate::proxy;
use crate::registry::Name;
use crate::shutdown::ShutdownSignal;
use crate::store::{MemoryStore, TunnelRecord, TunnelStore};
use crate::tunnel::{self, Broker};
use burrow_core::multiplex::{Accepted, Frame, GoAwayReason, Multiplexer, Role, OUTBOUND_QUEUE};
use burrow_core::relay::relay;
use burrow_core::{Handshake, RejectCode, SessionId, Token};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\nConnection: close\r\n\r\nhello, alice!";

const WAIT: Duration = Duration::from_secs(5);

fn record(id: i64, subdomain: &str) -> TunnelRecord {
    TunnelRecord {
        id,
        owner_id: id,
        name: "Default".to_string(),
        subdomain: subdomain.to_string(),
        last_tcp_port: None,
        dynamic_forwards: vec![],
    }
}

struct Harness {
    broker: Arc<Broker>,
    store: Arc<MemoryStore>,
    control: SocketAddr,
    http: SocketAddr,
}

async fn start(extra: &[&str]) -> Harness {
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control.local_addr().unwrap();
    let http_addr = http.local_addr().unwrap();

    let http_port = http_addr.port().to_string();
    let mut args = vec![
        "burrowd",
        "--domain",
        "example.com",
        "--bind",
        "127.0.0.1",
        "--http-port",
        http_port.as_str(),
    ];
    args.extend_from_slice(extra);
    let config = ServerConfig::parse_from(args);

    let store = Arc::new(MemoryStore::new());
    store.insert("tok-alice", record(1, "alice"));
    store.insert("tok-bob", record(2, "bob"));
    // A second tunnel that ended up with the same subdomain.
    store.insert("tok-bob-again", record(3, "bob"));

    let shutdown = ShutdownSignal::new(Duration::from_secs(1));
    let broker = Broker::new(config, store.clone(), shutdown.clone()).unwrap();
    tokio::spawn(tunnel::run_control_server(
        control,
        tunnel::control_router(broker.clone()),
        shutdown,
    ));
    tokio::spawn(proxy::run_proxy_server(http, broker.http_door()));

    Harness {
        broker,
        store,
        control: control_addr,
        http: http_addr,
    }
}

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Open a transport, send `message` and return the broker's answer.
async fn handshake(h: &Harness, message: Handshake) -> (Ws, Handshake) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", h.control))
        .await
        .unwrap();
    ws.send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return (ws, Handshake::from_json(text.as_bytes()).unwrap()),
            _ => continue,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    GoAway(GoAwayReason),
    Closed,
}

struct TestClient {
    session_id: SessionId,
    tcp_port: Option<u16>,
    accepted: Option<mpsc::UnboundedReceiver<Accepted>>,
    events: mpsc::UnboundedReceiver<Event>,
    raw: mpsc::Sender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for TestClient {
    /// Dropping the client kills the transport without a close frame.
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TestClient {
    async fn connect(h: &Harness, token: &str, tcp: bool, heartbeat: bool) -> Self {
        let (ws, reply) = handshake(h, Handshake::hello(token, tcp)).await;
        let (session_id, tcp_port) = match reply {
            Handshake::Welcome {
                session_id,
                tcp_port,
                ..
            } => (session_id, tcp_port),
            other => panic!("expected welcome, got {:?}", other),
        };

        let (mut sink, mut stream) = ws.split();
        let mut tasks = Vec::new();
        let (raw, mut raw_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = raw_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        }));

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let forward = raw.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let msg = Message::Binary(frame.encode().unwrap());
                if forward.send(msg).await.is_err() {
                    break;
                }
            }
        }));

        if heartbeat {
            let frames = frame_tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    if frames.send(Frame::Heartbeat).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let mux = Multiplexer::new(Role::Client, frame_tx);
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Binary(data) => match Frame::decode(&data) {
                        Ok(Frame::Heartbeat) => {}
                        Ok(Frame::GoAway { reason }) => {
                            let _ = events_tx.send(Event::GoAway(reason));
                        }
                        Ok(frame) => {
                            if let Some(a) = mux.handle_frame(frame).await {
                                let _ = accepted_tx.send(a);
                            }
                        }
                        Err(_) => break,
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            mux.shutdown();
            let _ = events_tx.send(Event::Closed);
        }));

        Self {
            session_id,
            tcp_port,
            accepted: Some(accepted),
            events,
            raw,
            tasks,
        }
    }

    /// Relay every stream the broker opens to `upstream`.
    fn serve(&mut self, upstream: SocketAddr) {
        let mut accepted = self.accepted.take().expect("already serving");
        tokio::spawn(async move {
            while let Some(a) = accepted.recv().await {
                tokio::spawn(async move {
                    let socket = TcpStream::connect(upstream).await.unwrap();
                    let _ = relay(a.stream, socket, Duration::from_secs(10)).await;
                });
            }
        });
    }

    async fn next_accepted(&mut self) -> Accepted {
        let accepted = self.accepted.as_mut().expect("already serving");
        tokio::time::timeout(WAIT, accepted.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_event(&mut self) -> Event {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

/// Upstream that answers any request with [`RESPONSE`] and closes.
async fn http_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                socket.write_all(RESPONSE).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });
    addr
}

/// Upstream that echoes every byte back.
async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

async fn http_get(addr: SocketAddr, host: &str) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n", host).as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(WAIT, socket.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Poll until `cond` holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

fn alice() -> Name {
    Name::Subdomain("alice".to_string())
}

#[tokio::test]
async fn test_http_request_is_relayed_byte_exact() {
    let h = start(&[]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;
    client.serve(http_upstream().await);

    assert_eq!(
        h.broker.registry.lookup(&alice()).unwrap().id,
        client.session_id
    );
    let response = http_get(h.http, "alice.example.com").await;
    assert_eq!(response, RESPONSE);

    // Host matching is case-insensitive and the local test domain works too.
    assert_eq!(http_get(h.http, "ALICE.example.com").await, RESPONSE);
    assert_eq!(http_get(h.http, "alice.localhost").await, RESPONSE);
}

#[tokio::test]
async fn test_unknown_tunnel_and_bad_requests() {
    let h = start(&[]).await;

    let response = http_get(h.http, "nobody.example.com").await;
    assert!(response.starts_with(b"HTTP/1.1 404"));
    assert!(String::from_utf8_lossy(&response).contains("Tunnel not found"));

    let response = http_get(h.http, "example.com").await;
    assert!(response.starts_with(b"HTTP/1.1 404"));

    let mut socket = TcpStream::connect(h.http).await.unwrap();
    socket
        .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 400"));
}

#[tokio::test]
async fn test_http_hint_is_destination_port() {
    let h = start(&[]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;

    for (host, hint) in [
        ("alice.example.com:8443".to_string(), 8443),
        ("alice.example.com".to_string(), h.http.port()),
    ] {
        let mut public = TcpStream::connect(h.http).await.unwrap();
        public
            .write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host).as_bytes())
            .await
            .unwrap();
        let accepted = client.next_accepted().await;
        assert_eq!(accepted.target_hint, Some(hint));
    }
}

#[tokio::test]
async fn test_reconnect_displaces_previous_session() {
    let h = start(&[]).await;
    let mut first = TestClient::connect(&h, "tok-alice", false, true).await;
    let mut second = TestClient::connect(&h, "tok-alice", false, true).await;

    assert_eq!(
        first.next_event().await,
        Event::GoAway(GoAwayReason::Replaced)
    );
    assert_eq!(first.next_event().await, Event::Closed);
    assert_eq!(
        h.broker.registry.lookup(&alice()).unwrap().id,
        second.session_id
    );
    assert_eq!(h.broker.lifecycle.session_count(), 1);

    second.serve(http_upstream().await);
    assert_eq!(http_get(h.http, "alice.example.com").await, RESPONSE);
}

#[tokio::test]
async fn test_unclean_disconnect_then_reconnect() {
    let h = start(&[]).await;
    let client = TestClient::connect(&h, "tok-alice", false, true).await;
    drop(client);

    let registry = h.broker.registry.clone();
    eventually(|| registry.lookup(&alice()).is_none()).await;
    let response = http_get(h.http, "alice.example.com").await;
    assert!(response.starts_with(b"HTTP/1.1 404"));

    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;
    client.serve(http_upstream().await);
    assert_eq!(http_get(h.http, "alice.example.com").await, RESPONSE);
}

#[tokio::test]
async fn test_second_tunnel_on_same_subdomain_conflicts() {
    let h = start(&[]).await;
    let bob = TestClient::connect(&h, "tok-bob", false, true).await;

    let (_ws, reply) = handshake(&h, Handshake::hello("tok-bob-again", false)).await;
    match reply {
        Handshake::Rejected { code, .. } => assert_eq!(code, RejectCode::BindConflict),
        other => panic!("expected rejection, got {:?}", other),
    }

    let holder = h
        .broker
        .registry
        .lookup(&Name::Subdomain("bob".into()))
        .unwrap();
    assert_eq!(holder.id, bob.session_id);
    assert!(holder.is_live());
}

#[tokio::test]
async fn test_handshake_rejections() {
    let h = start(&[]).await;

    let (_ws, reply) = handshake(&h, Handshake::hello("tok-unknown", false)).await;
    assert!(matches!(
        reply,
        Handshake::Rejected {
            code: RejectCode::Unauthorized,
            ..
        }
    ));

    let old_client = Handshake::Hello {
        version: 99,
        token: "tok-alice".to_string(),
        tcp: false,
    };
    let (_ws, reply) = handshake(&h, old_client).await;
    assert!(matches!(
        reply,
        Handshake::Rejected {
            code: RejectCode::UnsupportedVersion,
            ..
        }
    ));

    assert!(h.broker.registry.is_empty());
    assert_eq!(h.broker.lifecycle.session_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_timeout_tears_down() {
    let h = start(&["--heartbeat-interval", "1", "--heartbeat-misses", "1"]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, false).await;

    // A public connection whose stream the client never answers.
    let mut public = TcpStream::connect(h.http).await.unwrap();
    public
        .write_all(b"GET / HTTP/1.1\r\nHost: alice.example.com\r\n\r\n")
        .await
        .unwrap();
    let _held = client.next_accepted().await;

    assert_eq!(client.next_event().await, Event::Closed);
    assert!(h.broker.registry.lookup(&alice()).is_none());

    // The public side observes the close instead of hanging.
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(WAIT, public.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_renamed_tunnel_is_revoked() {
    let h = start(&[]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;

    h.store.rename_subdomain(1, "alice2").unwrap();
    assert_eq!(h.broker.lifecycle.revalidate_all().await, 1);

    assert_eq!(
        client.next_event().await,
        Event::GoAway(GoAwayReason::Revoked)
    );
    assert!(h.broker.registry.lookup(&alice()).is_none());

    // Reconnecting picks up the new name.
    let (_ws, reply) = handshake(&h, Handshake::hello("tok-alice", false)).await;
    match reply {
        Handshake::Welcome { subdomain, url, .. } => {
            assert_eq!(subdomain, "alice2");
            assert!(url.starts_with("http://alice2.example.com"));
        }
        other => panic!("expected welcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_frame_ends_only_that_session() {
    let h = start(&[]).await;
    let mut alice_client = TestClient::connect(&h, "tok-alice", false, true).await;
    let mut bob_client = TestClient::connect(&h, "tok-bob", false, true).await;
    bob_client.serve(http_upstream().await);

    alice_client
        .raw
        .send(Message::Binary(vec![0xff, 0xff, 0xff]))
        .await
        .unwrap();
    assert_eq!(alice_client.next_event().await, Event::Closed);

    let registry = h.broker.registry.clone();
    eventually(|| registry.lookup(&alice()).is_none()).await;
    assert_eq!(http_get(h.http, "bob.example.com").await, RESPONSE);
}

#[tokio::test]
async fn test_tcp_door_relays_and_persists_port() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
        .to_string();
    let h = start(&["--tcp-port-start", &port, "--tcp-port-end", &port]).await;
    let mut client = TestClient::connect(&h, "tok-alice", true, true).await;

    let tcp_port = client.tcp_port.expect("tcp port in welcome");
    assert_eq!(tcp_port.to_string(), port);
    let stored = h
        .store
        .resolve_token(&Token::parse("tok-alice").unwrap())
        .await
        .unwrap();
    assert_eq!(stored.last_tcp_port, Some(tcp_port));

    let mut public = TcpStream::connect(("127.0.0.1", tcp_port)).await.unwrap();
    let accepted = client.next_accepted().await;
    assert_eq!(accepted.target_hint, Some(tcp_port));
    let echo = echo_upstream().await;
    tokio::spawn(async move {
        let socket = TcpStream::connect(echo).await.unwrap();
        let _ = relay(accepted.stream, socket, Duration::from_secs(10)).await;
    });

    public.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, public.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_concurrent_streams_do_not_cross_talk() {
    let h = start(&[]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;
    client.serve(echo_upstream().await);

    let tasks: Vec<_> = (0u8..4)
        .map(|i| {
            let http = h.http;
            tokio::spawn(async move {
                let mut request = b"POST / HTTP/1.1\r\nHost: alice.example.com\r\n\r\n".to_vec();
                request.extend((0..64 * 1024).map(|j| (j as u8).wrapping_mul(31).wrapping_add(i)));

                let socket = TcpStream::connect(http).await.unwrap();
                let (mut r, mut w) = socket.into_split();
                let expected = request.clone();
                let writer = tokio::spawn(async move { w.write_all(&request).await.unwrap() });

                let mut echoed = vec![0u8; expected.len()];
                tokio::time::timeout(WAIT, r.read_exact(&mut echoed))
                    .await
                    .unwrap()
                    .unwrap();
                writer.await.unwrap();
                assert!(echoed == expected, "stream {} received foreign bytes", i);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_tcp_reconnect_keeps_port() {
    // A single-port range: the reconnect has to take over the same listener.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let range = port.to_string();
    let h = start(&["--tcp-port-start", &range, "--tcp-port-end", &range]).await;

    let mut first = TestClient::connect(&h, "tok-alice", true, true).await;
    assert_eq!(first.tcp_port, Some(port));

    for _ in 0..2 {
        let mut next = TestClient::connect(&h, "tok-alice", true, true).await;
        assert_eq!(next.tcp_port, Some(port));
        assert_eq!(
            first.next_event().await,
            Event::GoAway(GoAwayReason::Replaced)
        );

        // Both names moved to the new session, which serves right away.
        let registry = &h.broker.registry;
        assert_eq!(registry.lookup(&alice()).unwrap().id, next.session_id);
        assert_eq!(
            registry.lookup(&Name::Port(port)).unwrap().id,
            next.session_id
        );
        assert_eq!(h.broker.tcp.open_ports(), vec![port]);
        assert_eq!(h.broker.lifecycle.session_count(), 1);

        let _public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_eq!(next.next_accepted().await.target_hint, Some(port));

        first = next;
    }

    let stored = h
        .store
        .resolve_token(&Token::parse("tok-alice").unwrap())
        .await
        .unwrap();
    assert_eq!(stored.last_tcp_port, Some(port));
}

#[tokio::test]
async fn test_unreachable_upstream_answers_bad_gateway() {
    let h = start(&[]).await;
    let mut client = TestClient::connect(&h, "tok-alice", false, true).await;

    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut accepted = client.accepted.take().unwrap();
    tokio::spawn(async move {
        while let Some(a) = accepted.recv().await {
            // The local service is down: give up on the stream.
            let _ = TcpStream::connect(closed).await;
            drop(a);
        }
    });

    let response = http_get(h.http, "alice.example.com").await;
    assert!(
        response.starts_with(b"HTTP/1.1 502"),
        "got {:?}",
        String::from_utf8_lossy(&response)
    );
    assert!(h.broker.registry.lookup(&alice()).unwrap().is_live());
}

#[tokio::test]
async fn test_silent_client_hits_auth_timeout() {
    let h = start(&["--auth-timeout", "1"]).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", h.control))
        .await
        .unwrap();

    let reply = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return Handshake::from_json(text.as_bytes()).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        reply,
        Handshake::Rejected {
            code: RejectCode::Timeout,
            ..
        }
    ));
    assert_eq!(h.broker.lifecycle.session_count(), 0);
}

#[tokio::test]
async fn test_capacity_limit_rejects_new_tunnels() {
    let h = start(&["--max-sessions", "1"]).await;
    let alice_client = TestClient::connect(&h, "tok-alice", false, true).await;

    let (_ws, reply) = handshake(&h, Handshake::hello("tok-bob", false)).await;
    assert!(matches!(
        reply,
        Handshake::Rejected {
            code: RejectCode::Unavailable,
            ..
        }
    ));
    assert!(h.broker.registry.lookup(&Name::Subdomain("bob".into())).is_none());
    assert_eq!(
        h.broker.registry.lookup(&alice()).unwrap().id,
        alice_client.session_id
    );
}
