//! PostgreSQL-backed tunnel store.
//!
//! Reads the `tunnels` table owned by the management application. The
//! broker only ever updates `last_tcp_port`.

use crate::store::{StoreError, TunnelRecord, TunnelStore};
use async_trait::async_trait;
use burrow_core::Token;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{debug, info};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// How long a handshake may wait for a pooled connection
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub fn new(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// A row of the `tunnels` table
#[derive(Debug, Clone, sqlx::FromRow)]
struct TunnelRow {
    id: i64,
    principal_id: i64,
    name: String,
    subdomain: String,
    last_tcp_port: Option<i32>,
}

impl From<TunnelRow> for TunnelRecord {
    fn from(row: TunnelRow) -> Self {
        TunnelRecord {
            id: row.id,
            owner_id: row.principal_id,
            name: row.name,
            subdomain: row.subdomain,
            last_tcp_port: row
                .last_tcp_port
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0),
            // The table has no column for them.
            dynamic_forwards: Vec::new(),
        }
    }
}

/// Tunnel store over the management database.
#[derive(Clone)]
pub struct PgTunnelStore {
    pool: PgPool,
}

impl PgTunnelStore {
    /// Create a new database connection pool
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(unavailable)?;

        info!("Database connected successfully");
        Ok(Self { pool })
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl TunnelStore for PgTunnelStore {
    async fn resolve_token(&self, token: &Token) -> Result<TunnelRecord, StoreError> {
        let row = sqlx::query_as::<_, TunnelRow>(
            r#"
            SELECT id, principal_id, name, subdomain, last_tcp_port
            FROM tunnels
            WHERE token = $1
            "#,
        )
        .bind(token.expose())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                debug!("Token {} not found", token.fingerprint());
                Err(StoreError::NotFound)
            }
        }
    }

    async fn persist_allocated_port(&self, tunnel_id: i64, port: u16) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tunnels SET last_tcp_port = $1 WHERE id = $2")
            .bind(i32::from(port))
            .bind(tunnel_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        debug!("Tunnel {} now remembers port {}", tunnel_id, port);
        Ok(())
    }
}
