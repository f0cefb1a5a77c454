//! HTTP front door for tunneled traffic.
//!
//! The request is not parsed beyond its head: the Host header selects the
//! tunnel, then the bytes already read and the rest of the connection are
//! relayed verbatim, so keep-alive, upgrades and bodies pass through untouched.

use crate::dispatch::{Dispatcher, Served};
use crate::registry::Name;
use crate::shutdown::ShutdownSignal;
use anyhow::Result;
use burrow_core::multiplex::StreamError;
use burrow_core::protocol::is_valid_subdomain;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Largest request head accepted before the Host header must have appeared.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Time a public client has to send its request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings and collaborators of the HTTP front door.
pub struct HttpDoor {
    /// Public domain tunnels are served under.
    pub domain: String,
    /// Port the door listens on; the hint when Host carries no port.
    pub http_port: u16,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: ShutdownSignal,
}

/// Run the HTTP front door until shutdown.
pub async fn run_proxy_server(listener: TcpListener, door: Arc<HttpDoor>) -> Result<()> {
    info!("HTTP front door listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            _ = door.shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let guard = door.shutdown.register_connection();
                    let door = door.clone();
                    tokio::spawn(async move {
                        handle_connection(socket, peer, &door).await;
                        drop(guard);
                    });
                }
                Err(e) => warn!("HTTP accept error: {}", e),
            }
        }
    }
    info!("HTTP front door stopped accepting");
    Ok(())
}

#[derive(Debug)]
enum HeadError {
    TooLarge,
    Closed,
    Io(std::io::Error),
}

/// Read until the end of the request head. Returns everything read so far,
/// which may include the start of the body.
async fn read_request_head(socket: &mut TcpStream) -> Result<(Vec<u8>, usize), HeadError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.map_err(HeadError::Io)?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf[search_from..]) {
            let head_len = search_from + pos;
            if head_len > MAX_HEAD_SIZE {
                return Err(HeadError::TooLarge);
            }
            return Ok((buf, head_len));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }
    }
}

/// Offset just past the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Value of the Host header.
fn parse_host(head: &[u8]) -> Option<&str> {
    let head = std::str::from_utf8(head).ok()?;
    head.split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Split an optional port off a Host value.
fn split_host_port(host: &str) -> (&str, Option<u16>) {
    if host.starts_with('[') {
        // IPv6 literal, never a tunnel host
        return match host.rsplit_once("]:") {
            Some((addr, port)) => (addr, port.parse().ok()),
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

/// Subdomain label of `host` under `domain`, lower-cased.
///
/// `<label>.localhost` is accepted as well for local testing.
pub fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();

    let label = host
        .strip_suffix(domain.as_str())
        .and_then(|prefix| prefix.strip_suffix('.'))
        .or_else(|| host.strip_suffix(".localhost"))?;

    if is_valid_subdomain(label) {
        Some(label.to_string())
    } else {
        None
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, door: &HttpDoor) {
    let _ = socket.set_nodelay(true);

    let (buf, head_len) =
        match tokio::time::timeout(HEAD_TIMEOUT, read_request_head(&mut socket)).await {
            Ok(Ok(head)) => head,
            Ok(Err(HeadError::TooLarge)) => {
                respond(&mut socket, 431, "Request header fields too large").await;
                return;
            }
            Ok(Err(HeadError::Closed)) => return,
            Ok(Err(HeadError::Io(e))) => {
                debug!("Reading request from {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                debug!("Request head from {} timed out", peer);
                respond(&mut socket, 408, "Request timeout").await;
                return;
            }
        };

    let Some(host) = parse_host(&buf[..head_len]) else {
        respond(&mut socket, 400, "Missing Host header").await;
        return;
    };
    let (hostname, port) = split_host_port(host);
    let Some(subdomain) = extract_subdomain(hostname, &door.domain) else {
        debug!("No tunnel subdomain in host {:?} from {}", host, peer);
        respond(&mut socket, 404, "Tunnel not found").await;
        return;
    };

    let hint = port.unwrap_or(door.http_port);
    let name = Name::Subdomain(subdomain);
    match door.dispatcher.open(&name, Some(hint), "http").await {
        Ok((session, stream)) => {
            debug!(
                "HTTP connection from {} for {} -> session {} stream {}",
                peer,
                name,
                session.id.short(),
                stream.id()
            );
            let served = door
                .dispatcher
                .serve(&session, stream, &mut socket, &buf, "http")
                .await;
            if let Served::NoResponse(e) = served {
                debug!("Tunnel {} gave no response to {}: {}", name, peer, e);
                match e {
                    StreamError::IdleTimeout => respond(&mut socket, 504, "Gateway timeout").await,
                    _ => respond(&mut socket, 502, "Bad gateway").await,
                }
            }
        }
        Err(e) => {
            debug!("Dispatch for {} from {} failed: {}", name, peer, e);
            let message = match e.http_status() {
                404 => "Tunnel not found",
                503 => "Service unavailable",
                _ => "Bad gateway",
            };
            respond(&mut socket, e.http_status(), message).await;
        }
    }
}

/// Write a minimal plain-text response and close.
async fn respond(socket: &mut TcpStream, status: u16, message: &str) {
    let body = format!("{}\n", message);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!("Writing {} response failed: {}", status, e);
    }
    let _ = socket.shutdown().await;
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
