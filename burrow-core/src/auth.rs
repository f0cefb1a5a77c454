//! Tunnel tokens.
//!
//! A token is an opaque secret minted by the management side and resolved by
//! the metadata store. The broker never logs a raw token; it logs the
//! fingerprint instead.

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token is empty")]
    Empty,
    #[error("Token contains whitespace or control characters")]
    InvalidCharacters,
}

/// An opaque tunnel token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Parse a token as presented by a client.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        if raw.is_empty() {
            return Err(TokenError::Empty);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TokenError::InvalidCharacters);
        }
        Ok(Self(raw.to_string()))
    }

    /// Mint a new random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The raw token, for presenting to the store.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// SHA-256 digest of the token.
    pub fn digest(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(self.0.as_bytes()));
        out
    }

    /// Short hex prefix of the digest, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest()[..6])
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.fingerprint())
    }
}
