//! Routing of public connections onto tunnel sessions.
//!
//! Both front doors resolve a [`Name`], then hand the connection here to open
//! a stream on the session bound to it and relay bytes until one side ends.

use crate::metrics;
use crate::registry::{Name, Registry};
use crate::session::SessionHandle;
use burrow_core::multiplex::{MuxStream, StreamError};
use burrow_core::relay::relay;
use burrow_core::{TunnelError, TunnelResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Opens streams against registered sessions and relays public connections.
pub struct Dispatcher {
    registry: Arc<Registry>,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }

    /// Open a stream on the session serving `name`.
    ///
    /// A lookup can race with a reconnect and return a session that is
    /// drained right after; in that case the lookup and open are retried once.
    pub async fn open(
        &self,
        name: &Name,
        target_hint: Option<u16>,
        door: &'static str,
    ) -> TunnelResult<(Arc<SessionHandle>, MuxStream)> {
        let session = self.lookup(name, door)?;
        match session.open_stream(target_hint).await {
            Ok(stream) => return Ok((session, stream)),
            Err(StreamError::TooManyStreams) => {
                return Err(TunnelError::unavailable(format!(
                    "tunnel {} has too many open streams",
                    name
                )));
            }
            Err(e) => {
                debug!(
                    "Opening stream on session {} for {} failed ({}), retrying",
                    session.id.short(),
                    name,
                    e
                );
            }
        }

        let session = self.lookup(name, door)?;
        let stream = session.open_stream(target_hint).await.map_err(|e| {
            TunnelError::stream_closed(format!("tunnel {} went away", name))
                .with_context("session", session.id.short())
                .with_cause(e)
        })?;
        Ok((session, stream))
    }

    fn lookup(&self, name: &Name, door: &'static str) -> TunnelResult<Arc<SessionHandle>> {
        self.registry.lookup(name).ok_or_else(|| {
            metrics::record_dispatch_miss(door);
            TunnelError::dispatch_miss(format!("no tunnel bound to {}", name))
        })
    }

    /// Send `preamble` (bytes already read from the public side), then relay
    /// until both directions finish, the stream idles out or either side fails.
    pub async fn serve<T>(
        &self,
        session: &SessionHandle,
        mut stream: MuxStream,
        io: T,
        preamble: &[u8],
        door: &'static str,
    ) -> Served
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let stream_id = stream.id();
        let meter = stream.meter();
        let started = Instant::now();

        if !preamble.is_empty() {
            if let Err(e) = stream.write(preamble).await {
                debug!(
                    "Stream {} on session {} failed before relaying: {}",
                    stream_id,
                    session.id.short(),
                    e
                );
                metrics::record_stream_aborted(door, "closed");
                return Served::NoResponse(e);
            }
        }

        let error = match relay(stream, io, self.idle_timeout).await {
            Ok(stats) => {
                debug!(
                    "Stream {} on {} finished: {} bytes out, {} bytes in",
                    stream_id,
                    session.subdomain(),
                    stats.bytes_sent,
                    stats.bytes_received
                );
                metrics::record_stream_relayed(door, stats, started.elapsed());
                return Served::Finished;
            }
            Err(StreamError::IdleTimeout) => {
                info!(
                    "Stream {} on {} idle for {:?}, aborted",
                    stream_id,
                    session.subdomain(),
                    self.idle_timeout
                );
                metrics::record_stream_aborted(door, "idle");
                StreamError::IdleTimeout
            }
            Err(e) => {
                debug!(
                    "Stream {} on {} ended with error: {}",
                    stream_id,
                    session.subdomain(),
                    e
                );
                metrics::record_stream_aborted(door, "error");
                e
            }
        };

        if meter.stats().bytes_received == 0 {
            Served::NoResponse(error)
        } else {
            Served::Finished
        }
    }
}

/// How a relayed public connection ended.
#[derive(Debug)]
pub enum Served {
    /// Relayed to the end, or failed after tunnel bytes reached the public side.
    Finished,
    /// Failed before a single byte came back through the tunnel; the public
    /// socket is still open for an error response.
    NoResponse(StreamError),
}
