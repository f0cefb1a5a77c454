//! Tunnel metadata store.
//!
//! The broker only reads tunnels by token and writes back the TCP port it
//! allocated. Tunnels are created, renamed and deleted by the management
//! side; the in-memory store exposes those operations so they can be driven
//! from a tunnels file or from tests.

use async_trait::async_trait;
use burrow_core::protocol::{is_valid_subdomain, DynamicForward};
use burrow_core::{ErrorCategory, Token, TunnelError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A tunnel as known to the management side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub subdomain: String,
    /// Port handed out the last time this tunnel asked for TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_forwards: Vec<DynamicForward>,
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No tunnel has this token
    #[error("Token not found")]
    NotFound,

    /// Another tunnel already uses the subdomain
    #[error("Subdomain {0} is already taken")]
    SubdomainTaken(String),

    /// The backend could not answer
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for TunnelError {
    fn from(err: StoreError) -> Self {
        let category = match err {
            StoreError::NotFound => ErrorCategory::Authentication,
            StoreError::SubdomainTaken(_) => ErrorCategory::BindConflict,
            StoreError::Unavailable(_) => ErrorCategory::Store,
        };
        TunnelError::new(category, err.to_string()).with_cause(err)
    }
}

/// Read access to tunnel metadata, plus the one write the broker performs.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// Look up the tunnel a token belongs to.
    async fn resolve_token(&self, token: &Token) -> Result<TunnelRecord, StoreError>;

    /// Remember the TCP port allocated to a tunnel.
    async fn persist_allocated_port(&self, tunnel_id: i64, port: u16) -> Result<(), StoreError>;
}

/// One entry of the tunnels file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TunnelEntry {
    token: String,
    #[serde(flatten)]
    record: TunnelRecord,
}

/// In-memory store, optionally backed by a JSON tunnels file.
#[derive(Default)]
pub struct MemoryStore {
    tunnels: RwLock<HashMap<String, TunnelRecord>>,
    path: Option<PathBuf>,
    /// File contents as last loaded or written by this store.
    synced: Mutex<Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a tunnels file. Allocated ports are written back to it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = read_tunnels_file(&path)?;
        let tunnels = parse_tunnels(&path, &data)?;
        info!("Loaded {} tunnels from {}", tunnels.len(), path.display());
        Ok(Self {
            tunnels: RwLock::new(tunnels),
            path: Some(path),
            synced: Mutex::new(data),
        })
    }

    /// Re-read the tunnels file, replacing the current contents.
    ///
    /// Returns `None` when the file still holds what this store last loaded
    /// or wrote, e.g. after persisting an allocated port.
    pub fn reload(&self) -> Result<Option<usize>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let data = read_tunnels_file(path)?;
        let mut synced = self.synced.lock();
        if *synced == data {
            debug!("{} unchanged, nothing to reload", path.display());
            return Ok(None);
        }
        let tunnels = parse_tunnels(path, &data)?;
        let count = tunnels.len();
        *self.tunnels.write() = tunnels;
        *synced = data;
        debug!("Reloaded {} tunnels from {}", count, path.display());
        Ok(Some(count))
    }

    /// Path of the backing tunnels file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace the tunnel for a token.
    pub fn insert(&self, token: impl Into<String>, record: TunnelRecord) {
        self.tunnels.write().insert(token.into(), record);
    }

    /// Point a tunnel at a different subdomain.
    pub fn rename_subdomain(&self, tunnel_id: i64, subdomain: &str) -> Result<(), StoreError> {
        let mut tunnels = self.tunnels.write();
        if tunnels
            .values()
            .any(|r| r.subdomain == subdomain && r.id != tunnel_id)
        {
            return Err(StoreError::SubdomainTaken(subdomain.to_string()));
        }
        let record = tunnels
            .values_mut()
            .find(|r| r.id == tunnel_id)
            .ok_or(StoreError::NotFound)?;
        record.subdomain = subdomain.to_string();
        Ok(())
    }

    /// Delete a tunnel, revoking its token. Returns whether it existed.
    pub fn delete(&self, tunnel_id: i64) -> bool {
        let mut tunnels = self.tunnels.write();
        let before = tunnels.len();
        tunnels.retain(|_, r| r.id != tunnel_id);
        tunnels.len() != before
    }

    fn snapshot(&self) -> Vec<TunnelEntry> {
        let mut entries: Vec<TunnelEntry> = self
            .tunnels
            .read()
            .iter()
            .map(|(token, record)| TunnelEntry {
                token: token.clone(),
                record: record.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.record.id);
        entries
    }

    async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        *self.synced.lock() = json.clone();
        tokio::fs::write(path, json)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))
    }
}

fn read_tunnels_file(path: &Path) -> Result<Vec<u8>, StoreError> {
    std::fs::read(path).map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))
}

fn parse_tunnels(path: &Path, data: &[u8]) -> Result<HashMap<String, TunnelRecord>, StoreError> {
    let entries: Vec<TunnelEntry> = serde_json::from_slice(data)
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;

    let mut tunnels = HashMap::with_capacity(entries.len());
    for entry in entries {
        if !is_valid_subdomain(&entry.record.subdomain) {
            warn!(
                "Skipping tunnel {} with invalid subdomain {:?}",
                entry.record.id, entry.record.subdomain
            );
            continue;
        }
        tunnels.insert(entry.token, entry.record);
    }
    Ok(tunnels)
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn resolve_token(&self, token: &Token) -> Result<TunnelRecord, StoreError> {
        self.tunnels
            .read()
            .get(token.expose())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn persist_allocated_port(&self, tunnel_id: i64, port: u16) -> Result<(), StoreError> {
        {
            let mut tunnels = self.tunnels.write();
            let record = tunnels
                .values_mut()
                .find(|r| r.id == tunnel_id)
                .ok_or(StoreError::NotFound)?;
            record.last_tcp_port = Some(port);
        }
        self.save().await
    }
}
