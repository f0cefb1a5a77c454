//! Error taxonomy shared by the broker and the tunnel client.
//!
//! Errors carry a category plus free-form context so they can be logged with
//! enough detail and then mapped to whatever the peer understands: an HTTP
//! status for public clients, a reject code for tunnel clients.

use crate::protocol::RejectCode;
use std::fmt;

/// Error categories for the tunnel system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Token unknown or could not be verified.
    Authentication,
    /// Name already bound to a live session of another identity.
    BindConflict,
    /// No session is bound to the requested name.
    DispatchMiss,
    /// The stream was closed by the peer or its session went away.
    StreamClosed,
    /// Transport read/write failure.
    Transport,
    /// A frame could not be decoded.
    MalformedFrame,
    /// Peer speaks a different protocol version.
    Protocol,
    /// Metadata store failure.
    Store,
    /// Handshake or request timed out.
    Timeout,
    /// Broker is at capacity or out of ports.
    Unavailable,
    /// Configuration errors.
    Configuration,
    /// Internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::BindConflict => "bind_conflict",
            ErrorCategory::DispatchMiss => "dispatch_miss",
            ErrorCategory::StreamClosed => "stream_closed",
            ErrorCategory::Transport => "transport",
            ErrorCategory::MalformedFrame => "malformed_frame",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Store => "store",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A tunnel error with category and context.
#[derive(Debug)]
pub struct TunnelError {
    /// The error category.
    pub category: ErrorCategory,
    /// A human-readable message.
    pub message: String,
    /// The underlying cause, if any.
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Additional context as key-value pairs.
    pub context: Vec<(String, String)>,
}

impl TunnelError {
    /// Create a new tunnel error.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            context: Vec::new(),
        }
    }

    /// Add an underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Add context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Whether a tunnel client should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Transport
                | ErrorCategory::MalformedFrame
                | ErrorCategory::StreamClosed
                | ErrorCategory::Timeout
                | ErrorCategory::Unavailable
                | ErrorCategory::Store
        )
    }

    /// Errors that end the whole session rather than a single stream.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Transport | ErrorCategory::MalformedFrame
        )
    }

    /// HTTP status shown to public clients.
    pub fn http_status(&self) -> u16 {
        match self.category {
            ErrorCategory::Authentication => 401,
            ErrorCategory::BindConflict => 409,
            ErrorCategory::DispatchMiss => 404,
            ErrorCategory::StreamClosed => 502,
            ErrorCategory::Transport => 502,
            ErrorCategory::MalformedFrame => 502,
            ErrorCategory::Protocol => 400,
            ErrorCategory::Store => 503,
            ErrorCategory::Timeout => 504,
            ErrorCategory::Unavailable => 503,
            ErrorCategory::Configuration => 500,
            ErrorCategory::Internal => 500,
        }
    }

    /// Reject code sent to a tunnel client whose handshake failed.
    pub fn reject_code(&self) -> RejectCode {
        match self.category {
            // Store failures during the handshake are reported as auth failures.
            ErrorCategory::Authentication | ErrorCategory::Store => RejectCode::Unauthorized,
            ErrorCategory::BindConflict => RejectCode::BindConflict,
            ErrorCategory::Timeout => RejectCode::Timeout,
            ErrorCategory::MalformedFrame => RejectCode::BadHandshake,
            ErrorCategory::Protocol => RejectCode::UnsupportedVersion,
            _ => RejectCode::Unavailable,
        }
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;

        if !self.context.is_empty() {
            write!(f, " (")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, ")")?;
        }

        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<RejectCode> for TunnelError {
    fn from(code: RejectCode) -> Self {
        let category = match code {
            RejectCode::Unauthorized => ErrorCategory::Authentication,
            RejectCode::UnsupportedVersion => ErrorCategory::Protocol,
            RejectCode::BindConflict => ErrorCategory::BindConflict,
            RejectCode::Timeout => ErrorCategory::Timeout,
            RejectCode::BadHandshake => ErrorCategory::MalformedFrame,
            RejectCode::Unavailable => ErrorCategory::Unavailable,
        };
        Self::new(category, format!("rejected by broker: {}", code))
    }
}

// Convenience constructors
impl TunnelError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, message)
    }

    pub fn bind_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::BindConflict, message)
    }

    pub fn dispatch_miss(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DispatchMiss, message)
    }

    pub fn stream_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::StreamClosed, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::MalformedFrame, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Protocol, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Store, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unavailable, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Helper trait for adding context to errors.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn with_context(
        self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<T, TunnelError>;

    /// Convert error category.
    fn with_category(self, category: ErrorCategory) -> Result<T, TunnelError>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for Result<T, E> {
    fn with_context(
        self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<T, TunnelError> {
        self.map_err(|e| {
            TunnelError::internal(e.to_string())
                .with_cause(e)
                .with_context(key, value)
        })
    }

    fn with_category(self, category: ErrorCategory) -> Result<T, TunnelError> {
        self.map_err(|e| TunnelError::new(category, e.to_string()).with_cause(e))
    }
}
