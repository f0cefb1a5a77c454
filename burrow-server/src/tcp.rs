//! Raw TCP front doors.
//!
//! One listener per port bound in the registry. A listener is started when a
//! session claims its port and stopped once no session holds the port.
//! Claiming and releasing are serialized by one lock so a release can never
//! stop a listener that a reconnecting session has just claimed.

use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::registry::{Name, Registry, RegistryError};
use crate::session::SessionHandle;
use crate::shutdown::ShutdownSignal;
use burrow_core::{TunnelError, TunnelResult};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Fresh ports tried before a TCP claim gives up.
const BIND_ATTEMPTS: usize = 16;

/// Handle to a running listener
struct ListenerHandle {
    /// Shutdown signal sender
    shutdown_tx: oneshot::Sender<()>,
}

/// Ports of the configured range that currently have a listener.
struct PortPool {
    range_start: u16,
    range_end: u16,
    used_ports: HashSet<u16>,
}

impl PortPool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            range_start: start,
            range_end: end,
            used_ports: HashSet::new(),
        }
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    /// A free port not in `skip`, scanning from a random offset.
    fn pick_free(&self, skip: &HashSet<u16>) -> Option<u16> {
        let size = u32::from(self.range_end - self.range_start) + 1;
        let offset = rand::thread_rng().gen_range(0..size);
        (0..size)
            .map(|i| self.range_start + ((offset + i) % size) as u16)
            .find(|port| !self.used_ports.contains(port) && !skip.contains(port))
    }

    fn mark_used(&mut self, port: u16) {
        self.used_ports.insert(port);
    }

    fn release(&mut self, port: u16) {
        self.used_ports.remove(&port);
    }
}

struct DoorState {
    pool: PortPool,
    listeners: HashMap<u16, ListenerHandle>,
}

/// Manages the per-port public TCP listeners.
pub struct TcpDoors {
    bind_ip: IpAddr,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownSignal,
    state: Mutex<DoorState>,
}

impl TcpDoors {
    pub fn new(
        bind_ip: IpAddr,
        port_range: (u16, u16),
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            bind_ip,
            registry,
            dispatcher,
            shutdown,
            state: Mutex::new(DoorState {
                pool: PortPool::new(port_range.0, port_range.1),
                listeners: HashMap::new(),
            }),
        }
    }

    /// Bind a public port to `session` and make sure it is listening.
    ///
    /// `preferred` (the tunnel's last port) is reused when it is in range and
    /// either free or held by the same identity. Otherwise a random free port
    /// is chosen. Returns the port and the session it displaced, if any.
    pub fn claim_port(
        &self,
        session: &Arc<SessionHandle>,
        preferred: Option<u16>,
    ) -> TunnelResult<(u16, Option<Arc<SessionHandle>>)> {
        let mut state = self.state.lock();
        let mut tried = HashSet::new();

        if let Some(port) = preferred.filter(|p| state.pool.contains(*p)) {
            tried.insert(port);
            match self.try_port(&mut state, port, session) {
                Ok(displaced) => return Ok((port, displaced)),
                Err(e) => debug!(
                    "Previous port {} not reusable for tunnel {}: {}",
                    port, session.tunnel.id, e
                ),
            }
        }

        for _ in 0..BIND_ATTEMPTS {
            let Some(port) = state.pool.pick_free(&tried) else {
                break;
            };
            tried.insert(port);
            match self.try_port(&mut state, port, session) {
                Ok(displaced) => return Ok((port, displaced)),
                Err(e) => debug!("Port {} not usable: {}", port, e),
            }
        }

        Err(TunnelError::unavailable("no free TCP port in range")
            .with_context("tunnel", session.tunnel.id.to_string()))
    }

    fn try_port(
        &self,
        state: &mut DoorState,
        port: u16,
        session: &Arc<SessionHandle>,
    ) -> TunnelResult<Option<Arc<SessionHandle>>> {
        let started = if state.listeners.contains_key(&port) {
            false
        } else {
            let handle = self.start_listener(port)?;
            state.listeners.insert(port, handle);
            state.pool.mark_used(port);
            true
        };

        match self.registry.claim(Name::Port(port), session) {
            Ok(displaced) => {
                session.set_tcp_port(Some(port));
                metrics::set_open_tcp_ports(state.listeners.len());
                Ok(displaced)
            }
            Err(e) => {
                if started {
                    stop_listener(state, port);
                }
                if matches!(e, RegistryError::Conflict { .. }) {
                    metrics::record_bind_conflict("port");
                }
                Err(TunnelError::bind_conflict(e.to_string()))
            }
        }
    }

    fn start_listener(&self, port: u16) -> TunnelResult<ListenerHandle> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let listener = std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .and_then(TcpListener::from_std)
            .map_err(|e| {
                TunnelError::unavailable(format!("cannot listen on {}", addr)).with_cause(e)
            })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(tcp_door_loop(
            listener,
            port,
            self.dispatcher.clone(),
            self.shutdown.clone(),
            shutdown_rx,
        ));
        info!("TCP door listening on {}", addr);
        Ok(ListenerHandle { shutdown_tx })
    }

    /// Stop the listener on `port` unless a session still holds the port.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock();
        if self.registry.lookup(&Name::Port(port)).is_some() {
            return;
        }
        stop_listener(&mut state, port);
        metrics::set_open_tcp_ports(state.listeners.len());
    }

    /// Ports that currently have a listener.
    pub fn open_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

fn stop_listener(state: &mut DoorState, port: u16) {
    if let Some(handle) = state.listeners.remove(&port) {
        let _ = handle.shutdown_tx.send(());
        info!("TCP door on port {} closed", port);
    }
    state.pool.release(port);
}

async fn tcp_door_loop(
    listener: TcpListener,
    port: u16,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownSignal,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,
            _ = shutdown.wait() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let guard = shutdown.register_connection();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        handle_tcp_connection(socket, peer, port, &dispatcher).await;
                        drop(guard);
                    });
                }
                Err(e) => {
                    warn!("TCP door {} accept error: {}", port, e);
                }
            }
        }
    }
    debug!("TCP door {} stopped accepting", port);
}

async fn handle_tcp_connection(
    socket: TcpStream,
    peer: SocketAddr,
    port: u16,
    dispatcher: &Dispatcher,
) {
    let _ = socket.set_nodelay(true);
    match dispatcher.open(&Name::Port(port), Some(port), "tcp").await {
        Ok((session, stream)) => {
            debug!(
                "TCP connection from {} on port {} -> session {} stream {}",
                peer,
                port,
                session.id.short(),
                stream.id()
            );
            dispatcher.serve(&session, stream, socket, &[], "tcp").await;
        }
        Err(e) => debug!("Closing TCP connection from {} on port {}: {}", peer, port, e),
    }
}
