//! Broker configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Burrow broker - expose private services through persistent tunnels.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrowd")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Domain tunnels are served under (e.g., tunnel.example.com)
    #[arg(long, env = "BURROW_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Scheme used when building public tunnel URLs
    #[arg(long, env = "BURROW_PROXY_SCHEME", default_value = "http")]
    pub proxy_scheme: String,

    /// Address the listeners bind to
    #[arg(long, env = "BURROW_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port for tunnel client transport connections (WebSocket)
    #[arg(long, env = "BURROW_CONTROL_PORT", default_value = "8080")]
    pub control_port: u16,

    /// Port for public HTTP traffic
    #[arg(long, env = "BURROW_HTTP_PORT", default_value = "8000")]
    pub http_port: u16,

    /// First port of the public TCP range
    #[arg(long, env = "BURROW_TCP_PORT_START", default_value = "20000")]
    pub tcp_port_start: u16,

    /// Last port of the public TCP range (inclusive)
    #[arg(long, env = "BURROW_TCP_PORT_END", default_value = "20999")]
    pub tcp_port_end: u16,

    /// PostgreSQL connection string for the tunnels table
    #[arg(long, env = "BURROW_DATABASE_URL", conflicts_with = "tunnels_file")]
    pub database_url: Option<String>,

    /// JSON file listing tunnels and their tokens (watched for changes)
    #[arg(long, env = "BURROW_TUNNELS_FILE")]
    pub tunnels_file: Option<PathBuf>,

    /// Maximum number of concurrent sessions
    #[arg(long, env = "BURROW_MAX_SESSIONS", default_value = "1000")]
    pub max_sessions: usize,

    /// Maximum concurrent streams per session
    #[arg(long, env = "BURROW_MAX_STREAMS", default_value = "1000")]
    pub max_streams: usize,

    /// Per-stream flow control window in bytes
    #[arg(long, env = "BURROW_STREAM_WINDOW", default_value = "262144")]
    pub stream_window: u32,

    /// Seconds a new transport has to present its token
    #[arg(long, env = "BURROW_AUTH_TIMEOUT", default_value = "10")]
    pub auth_timeout: u64,

    /// Seconds between heartbeats
    #[arg(long, env = "BURROW_HEARTBEAT_INTERVAL", default_value = "15")]
    pub heartbeat_interval: u64,

    /// Missed heartbeat intervals before a session is torn down
    #[arg(long, env = "BURROW_HEARTBEAT_MISSES", default_value = "3")]
    pub heartbeat_misses: u32,

    /// Seconds without bytes before a relayed stream is aborted
    #[arg(long, env = "BURROW_STREAM_IDLE_TIMEOUT", default_value = "300")]
    pub stream_idle_timeout: u64,

    /// Seconds between token re-validations of live sessions
    #[arg(long, env = "BURROW_REVALIDATE_INTERVAL", default_value = "30")]
    pub revalidate_interval: u64,

    /// Seconds to wait for public connections to drain on shutdown
    #[arg(long, env = "BURROW_SHUTDOWN_TIMEOUT", default_value = "30")]
    pub shutdown_timeout: u64,

    /// Enable debug logging
    #[arg(long, env = "BURROW_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    /// Public URL of a subdomain tunnel.
    pub fn tunnel_url(&self, subdomain: &str) -> String {
        let default_port = match self.proxy_scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.http_port == default_port || self.proxy_scheme == "https" {
            format!("{}://{}.{}", self.proxy_scheme, subdomain, self.domain)
        } else {
            format!(
                "{}://{}.{}:{}",
                self.proxy_scheme, subdomain, self.domain, self.http_port
            )
        }
    }

    /// Inclusive range of ports handed out to TCP tunnels.
    pub fn tcp_port_range(&self) -> (u16, u16) {
        (self.tcp_port_start, self.tcp_port_end)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// How long a session may go without a heartbeat.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_misses.max(1)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout)
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Check settings that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.tcp_port_start > self.tcp_port_end {
            return Err(format!(
                "TCP port range {}-{} is empty",
                self.tcp_port_start, self.tcp_port_end
            ));
        }
        if self.heartbeat_interval == 0 {
            return Err("heartbeat interval must be at least one second".to_string());
        }
        if self.domain.is_empty() {
            return Err("domain must not be empty".to_string());
        }
        Ok(())
    }
}
