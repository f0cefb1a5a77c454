//! Handshake protocol for tunnel sessions.
//!
//! The first messages on a new transport are JSON text messages: the client
//! sends [`Handshake::Hello`], the broker answers with either
//! [`Handshake::Welcome`] or [`Handshake::Rejected`]. Everything after a
//! welcome is a binary [`crate::multiplex::Frame`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the handshake and frame format.
pub const PROTOCOL_VERSION: u16 = 1;

/// Longest DNS label accepted as a subdomain.
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// Unique identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, enough to tell sessions apart in logs.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A public destination port the client should forward to a specific target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicForward {
    pub port: u16,
    pub target: String,
}

/// Why the broker refused a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// Token unknown, or the store could not verify it.
    Unauthorized,
    /// Subdomain held by a live session with a different token.
    BindConflict,
    /// Broker at capacity or out of TCP ports.
    Unavailable,
    /// Client speaks another protocol version.
    UnsupportedVersion,
    /// No hello within the auth timeout.
    Timeout,
    /// First message was not a valid hello.
    BadHandshake,
}

impl RejectCode {
    /// Whether retrying with the same credentials can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectCode::Unavailable | RejectCode::Timeout)
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectCode::Unauthorized => "unauthorized",
            RejectCode::BindConflict => "bind_conflict",
            RejectCode::Unavailable => "unavailable",
            RejectCode::UnsupportedVersion => "unsupported_version",
            RejectCode::Timeout => "timeout",
            RejectCode::BadHandshake => "bad_handshake",
        };
        f.write_str(s)
    }
}

/// Handshake messages exchanged before any frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    /// Client greeting carrying its credentials.
    Hello {
        version: u16,
        token: String,
        /// Ask for a public TCP port in addition to the subdomain.
        #[serde(default)]
        tcp: bool,
    },
    /// Session accepted and bound.
    Welcome {
        session_id: SessionId,
        subdomain: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tcp_port: Option<u16>,
        #[serde(default)]
        dynamic_forwards: Vec<DynamicForward>,
        heartbeat_interval_secs: u64,
    },
    /// Session refused. The broker closes the transport afterwards.
    Rejected { code: RejectCode, message: String },
}

impl Handshake {
    /// Create a hello for the current protocol version.
    pub fn hello(token: impl Into<String>, tcp: bool) -> Self {
        Handshake::Hello {
            version: PROTOCOL_VERSION,
            token: token.into(),
            tcp,
        }
    }

    /// Create a rejection.
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        Handshake::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Turn an arbitrary identifier (user name, e-mail) into a subdomain label.
///
/// Returns `None` when nothing usable is left.
pub fn normalize_identifier(identifier: &str) -> Option<String> {
    let local = identifier.split('@').next().unwrap_or(identifier);

    let mut label = String::with_capacity(local.len());
    for c in local.trim().chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && label.ends_with('-') {
            continue;
        }
        label.push(c);
    }

    let label: String = label
        .trim_matches('-')
        .chars()
        .take(MAX_SUBDOMAIN_LEN)
        .collect();
    let label = label.trim_end_matches('-').to_string();

    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Whether `label` is a valid lower-case DNS label.
pub fn is_valid_subdomain(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_SUBDOMAIN_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}
