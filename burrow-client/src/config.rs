//! Client configuration and forward-target selection.

use burrow_core::DynamicForward;
use clap::Parser;
use std::time::Duration;
use tracing::warn;

/// Burrow - expose a local service through a burrow broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Broker control address (host:port or ws[s]://host:port)
    #[arg(short, long, env = "BURROW_SERVER", default_value = "localhost:8080")]
    pub server: String,

    /// Tunnel token
    #[arg(short, long, env = "BURROW_TOKEN")]
    pub token: String,

    /// Local address to forward to (3000, :3000, host:port or http://host:port)
    #[arg(
        short,
        long,
        env = "BURROW_FORWARD",
        default_value = "3000",
        value_parser = derive_forward_addr
    )]
    pub forward: String,

    /// Extra target selected by public port. Format: PORT=ADDR
    /// Example: --dynamic-forward 8443=127.0.0.1:8443
    #[arg(long = "dynamic-forward", value_parser = parse_dynamic_forward)]
    pub dynamic_forwards: Vec<DynamicForward>,

    /// Ask the broker for a public TCP port as well
    #[arg(long, env = "BURROW_TCP")]
    pub tcp: bool,

    /// Use TLS for the broker connection
    #[arg(long, env = "BURROW_TLS")]
    pub tls: bool,

    /// Reconnect delay in seconds
    #[arg(long, env = "BURROW_RECONNECT_DELAY", default_value = "5")]
    pub reconnect_delay: u64,

    /// Maximum reconnect attempts (0 = infinite)
    #[arg(long, env = "BURROW_MAX_RECONNECTS", default_value = "0")]
    pub max_reconnects: u32,

    /// Missed broker heartbeats before the connection is dropped
    #[arg(long, env = "BURROW_HEARTBEAT_MISSES", default_value = "3")]
    pub heartbeat_misses: u32,

    /// Seconds without bytes before a forwarded stream is closed
    #[arg(long, env = "BURROW_STREAM_IDLE_TIMEOUT", default_value = "300")]
    pub stream_idle_timeout: u64,

    /// Check that the forward address accepts connections before connecting
    #[arg(long, env = "BURROW_VERIFY_UPSTREAM")]
    pub verify_upstream: bool,

    /// Exit if the upstream check fails
    #[arg(long, env = "BURROW_REQUIRE_UPSTREAM", requires = "verify_upstream")]
    pub require_upstream: bool,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    /// Get the WebSocket URL of the broker's control endpoint.
    pub fn ws_url(&self) -> String {
        let server = &self.server;

        if server.starts_with("ws://") || server.starts_with("wss://") {
            return format!("{}/ws", server.trim_end_matches('/'));
        }

        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}/ws", scheme, server)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout)
    }

    /// Targets for one session, given what the broker advertised.
    pub fn targets(&self, advertised: &[DynamicForward]) -> ForwardTargets {
        let advertised = advertised
            .iter()
            .filter_map(|f| match derive_forward_addr(&f.target) {
                Ok(target) => Some(DynamicForward {
                    port: f.port,
                    target,
                }),
                Err(e) => {
                    warn!("Ignoring advertised forward {}: {}", f.port, e);
                    None
                }
            })
            .collect();
        ForwardTargets {
            default: self.forward.clone(),
            local: self.dynamic_forwards.clone(),
            advertised,
        }
    }
}

/// Where streams opened by the broker are sent.
#[derive(Debug, Clone)]
pub struct ForwardTargets {
    default: String,
    local: Vec<DynamicForward>,
    advertised: Vec<DynamicForward>,
}

impl ForwardTargets {
    /// Pick the target for a stream. Command-line forwards win over the
    /// ones the broker advertised; anything else goes to the default.
    pub fn select(&self, hint: Option<u16>) -> &str {
        let Some(port) = hint else {
            return &self.default;
        };
        self.local
            .iter()
            .chain(self.advertised.iter())
            .find(|f| f.port == port)
            .map(|f| f.target.as_str())
            .unwrap_or(&self.default)
    }

    pub fn default_target(&self) -> &str {
        &self.default
    }
}

/// Normalize a forward address to `host:port`.
///
/// `3000` and `:3000` mean a port on the loopback interface. A URL keeps its
/// authority, with the scheme's default port when none is given.
pub fn derive_forward_addr(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("forward address is empty".to_string());
    }

    if let Some(port) = raw.strip_prefix(':').or(Some(raw)).filter(|p| is_port(p)) {
        return Ok(format!("127.0.0.1:{}", port));
    }

    let (authority, default_port) = match raw.split_once("://") {
        Some((scheme, rest)) => {
            let port = match scheme.to_ascii_lowercase().as_str() {
                "http" | "ws" => 80,
                "https" | "wss" => 443,
                other => return Err(format!("unsupported scheme {:?}", other)),
            };
            let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
            (authority, Some(port))
        }
        None => (raw, None),
    };

    if authority.is_empty() {
        return Err(format!("no host in {:?}", raw));
    }

    // Bracketed IPv6 literals carry colons of their own.
    let port_sep = match authority.rfind(']') {
        Some(end) => authority[end..].find(':').map(|i| i + end),
        None => authority.rfind(':'),
    };
    match (port_sep, default_port) {
        (Some(i), _) => {
            let (host, port) = (&authority[..i], &authority[i + 1..]);
            if !is_port(port) {
                return Err(format!("invalid port in {:?}", raw));
            }
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            Ok(format!("{}:{}", host, port))
        }
        (None, Some(port)) => Ok(format!("{}:{}", authority, port)),
        (None, None) => Err(format!("missing port in {:?}", raw)),
    }
}

fn is_port(s: &str) -> bool {
    s.parse::<u16>().map(|p| p != 0).unwrap_or(false)
}

fn parse_dynamic_forward(s: &str) -> Result<DynamicForward, String> {
    let (port, target) = s
        .split_once('=')
        .ok_or_else(|| format!("expected PORT=ADDR, got {:?}", s))?;
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port number: {}", port))?;
    Ok(DynamicForward {
        port,
        target: derive_forward_addr(target)?,
    })
}
