//! Core types and protocols for the burrow tunnel broker.
//!
//! This crate provides shared functionality between the broker and the tunnel
//! client: the handshake, the frame codec and stream multiplexer, the byte
//! relay, and the error taxonomy.

pub mod auth;
pub mod error;
pub mod multiplex;
pub mod protocol;
pub mod relay;

pub use auth::Token;
pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use multiplex::{Frame, GoAwayReason, MuxStream, Multiplexer, Role, StreamError};
pub use protocol::{DynamicForward, Handshake, RejectCode, SessionId};
