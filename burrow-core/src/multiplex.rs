//! Stream multiplexing over a single tunnel transport.
//!
//! Many logical streams share one transport connection. Every stream has a
//! credit-based send window, so a consumer that stops reading stalls only its
//! own stream. The transport read loop hands each decoded frame to
//! [`Multiplexer::handle_frame`] and never blocks on a slow stream.

use bincode::Options;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// Stream identifier for multiplexed channels.
pub type StreamId = u32;

/// Maximum number of concurrent streams per session.
pub const MAX_STREAMS: usize = 10000;

/// Default flow control window size per stream direction.
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

/// Largest payload carried by a single data frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Capacity of the per-session transport write queue.
pub const OUTBOUND_QUEUE: usize = 256;

const MAX_FRAME_BYTES: u64 = MAX_FRAME_PAYLOAD as u64 + 1024;

/// Why a session is being ended by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoAwayReason {
    /// A newer connection with the same token took over the names.
    Replaced,
    /// The token was revoked or its tunnel changed.
    Revoked,
    /// The broker is shutting down.
    Shutdown,
}

impl std::fmt::Display for GoAwayReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoAwayReason::Replaced => write!(f, "replaced"),
            GoAwayReason::Revoked => write!(f, "revoked"),
            GoAwayReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A frame on the tunnel transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Broker asks the client to open a stream. The hint is the public
    /// destination port.
    Open {
        stream_id: StreamId,
        target_hint: Option<u16>,
    },
    /// Stream payload.
    Data { stream_id: StreamId, payload: Vec<u8> },
    /// End of the sender's direction (half-close).
    Close { stream_id: StreamId },
    /// Abort both directions.
    Reset { stream_id: StreamId },
    /// Grant the peer more send credit.
    WindowUpdate { stream_id: StreamId, increment: u32 },
    /// Keepalive.
    Heartbeat,
    /// Session is about to end.
    GoAway { reason: GoAwayReason },
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES)
}

impl Frame {
    /// Serialize to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(codec().serialize(self)?)
    }

    /// Deserialize from bytes. Any failure means the transport is out of sync.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        Ok(codec().deserialize(data)?)
    }

    /// Stream the frame belongs to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Close { stream_id }
            | Frame::Reset { stream_id }
            | Frame::WindowUpdate { stream_id, .. } => Some(*stream_id),
            Frame::Heartbeat | Frame::GoAway { .. } => None,
        }
    }
}

/// Stream errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("session closed")]
    Closed,
    #[error("stream reset")]
    Reset,
    #[error("too many open streams")]
    TooManyStreams,
    #[error("stream idle for too long")]
    IdleTimeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// State of a multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and can send/receive.
    Open,
    /// Local side has sent close.
    HalfClosedLocal,
    /// Remote side has sent close.
    HalfClosedRemote,
    /// Stream is fully closed or was reset.
    Closed,
}

/// Which side of the transport this multiplexer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Byte counters for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

const ABORT_NONE: u8 = 0;
const ABORT_RESET: u8 = 1;
const ABORT_SESSION: u8 = 2;

struct StreamShared {
    id: StreamId,
    /// Send credit granted by the peer.
    credit: Semaphore,
    /// Bytes received and not yet handed back as credit.
    unacked: AtomicU32,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
    abort: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StreamShared {
    fn new(id: StreamId, window: u32) -> Self {
        Self {
            id,
            credit: Semaphore::new(window as usize),
            unacked: AtomicU32::new(0),
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            abort: AtomicU8::new(ABORT_NONE),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    fn abort_error(&self) -> StreamError {
        match self.abort.load(Ordering::SeqCst) {
            ABORT_RESET => StreamError::Reset,
            _ => StreamError::Closed,
        }
    }

    fn state(&self) -> StreamState {
        if self.abort.load(Ordering::SeqCst) != ABORT_NONE {
            return StreamState::Closed;
        }
        match (
            self.local_closed.load(Ordering::SeqCst),
            self.remote_closed.load(Ordering::SeqCst),
        ) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

enum Inbound {
    Data(Vec<u8>),
    Abort,
}

struct Slot {
    shared: Arc<StreamShared>,
    /// Dropped when the peer half-closes.
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
}

impl Slot {
    fn abort(&self, kind: u8) {
        self.shared.abort.store(kind, Ordering::SeqCst);
        self.shared.credit.close();
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Inbound::Abort);
        }
    }
}

/// A stream opened by the peer.
pub struct Accepted {
    pub stream: MuxStream,
    pub target_hint: Option<u16>,
}

/// Multiplexer for managing multiple streams over a single connection.
pub struct Multiplexer {
    role: Role,
    /// Next stream ID to assign.
    next_stream_id: AtomicU32,
    streams: DashMap<StreamId, Slot>,
    outbound: mpsc::Sender<Frame>,
    window: u32,
    max_streams: usize,
    closed: AtomicBool,
}

impl Multiplexer {
    /// Create a multiplexer with default limits. Frames to send are pushed
    /// to `outbound`; the caller owns the transport writer.
    pub fn new(role: Role, outbound: mpsc::Sender<Frame>) -> Arc<Self> {
        Self::with_limits(role, outbound, DEFAULT_WINDOW_SIZE, MAX_STREAMS)
    }

    /// Create a multiplexer with explicit window and stream limits.
    pub fn with_limits(
        role: Role,
        outbound: mpsc::Sender<Frame>,
        window: u32,
        max_streams: usize,
    ) -> Arc<Self> {
        // Clients use odd stream IDs, servers use even
        let initial_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        Arc::new(Self {
            role,
            next_stream_id: AtomicU32::new(initial_id),
            streams: DashMap::new(),
            outbound,
            window: window.max(MAX_FRAME_PAYLOAD as u32),
            max_streams,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of streams currently registered.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a new stream towards the peer.
    pub async fn open(self: &Arc<Self>, target_hint: Option<u16>) -> Result<MuxStream, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        if self.streams.len() >= self.max_streams {
            warn!("Maximum streams reached ({})", self.max_streams);
            return Err(StreamError::TooManyStreams);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream = self.register(stream_id).ok_or(StreamError::Closed)?;

        self.outbound
            .send(Frame::Open {
                stream_id,
                target_hint,
            })
            .await
            .map_err(|_| StreamError::Closed)?;

        debug!("Opened stream {}", stream_id);
        Ok(stream)
    }

    fn register(self: &Arc<Self>, stream_id: StreamId) -> Option<MuxStream> {
        let shared = Arc::new(StreamShared::new(stream_id, self.window));
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(
            stream_id,
            Slot {
                shared: shared.clone(),
                inbound: Some(tx),
            },
        );

        // shutdown() may have swept the table before our insert landed
        if self.is_closed() {
            self.streams.remove(&stream_id);
            return None;
        }

        Some(MuxStream::new(shared, rx, self.clone()))
    }

    /// Process an incoming stream frame. Returns a stream the peer opened.
    ///
    /// Frames for unknown streams are dropped.
    pub async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Option<Accepted> {
        match frame {
            Frame::Open {
                stream_id,
                target_hint,
            } => self.accept(stream_id, target_hint).await,
            Frame::Data { stream_id, payload } => {
                self.deliver(stream_id, payload).await;
                None
            }
            Frame::Close { stream_id } => {
                match self.streams.get_mut(&stream_id) {
                    Some(mut slot) => {
                        slot.shared.remote_closed.store(true, Ordering::SeqCst);
                        slot.inbound = None;
                        trace!("Stream {} half-closed by peer", stream_id);
                    }
                    None => debug!("Dropping close for unknown stream {}", stream_id),
                }
                None
            }
            Frame::Reset { stream_id } => {
                match self.streams.remove(&stream_id) {
                    Some((_, slot)) => {
                        slot.abort(ABORT_RESET);
                        debug!("Stream {} reset by peer", stream_id);
                    }
                    None => trace!("Dropping reset for unknown stream {}", stream_id),
                }
                None
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let overflow = match self.streams.get(&stream_id) {
                    Some(slot) => {
                        let available = slot.shared.credit.available_permits();
                        if available + increment as usize > self.window as usize {
                            true
                        } else {
                            slot.shared.credit.add_permits(increment as usize);
                            false
                        }
                    }
                    None => {
                        trace!("Dropping window update for unknown stream {}", stream_id);
                        false
                    }
                };
                if overflow {
                    warn!("Stream {} granted credit beyond its window, resetting", stream_id);
                    self.reset(stream_id).await;
                }
                None
            }
            Frame::Heartbeat | Frame::GoAway { .. } => {
                trace!("Ignoring session-level frame in multiplexer");
                None
            }
        }
    }

    async fn accept(self: &Arc<Self>, stream_id: StreamId, target_hint: Option<u16>) -> Option<Accepted> {
        let is_valid = match self.role {
            Role::Client => stream_id % 2 == 0, // Server-initiated streams are even
            Role::Server => stream_id % 2 == 1, // Client-initiated streams are odd
        };

        if !is_valid {
            warn!("Invalid stream ID {} for this side", stream_id);
            let _ = self.outbound.send(Frame::Reset { stream_id }).await;
            return None;
        }

        if self.is_closed() {
            return None;
        }

        if self.streams.contains_key(&stream_id) {
            warn!("Duplicate open for stream {}", stream_id);
            return None;
        }

        if self.streams.len() >= self.max_streams {
            warn!("Maximum streams reached ({})", self.max_streams);
            let _ = self.outbound.send(Frame::Reset { stream_id }).await;
            return None;
        }

        let stream = self.register(stream_id)?;
        debug!("Accepted stream {}", stream_id);
        Some(Accepted {
            stream,
            target_hint,
        })
    }

    async fn deliver(&self, stream_id: StreamId, payload: Vec<u8>) {
        let violated = {
            let Some(slot) = self.streams.get(&stream_id) else {
                debug!("Dropping data for unknown stream {}", stream_id);
                return;
            };
            let Some(tx) = slot.inbound.as_ref() else {
                debug!("Dropping data for half-closed stream {}", stream_id);
                return;
            };

            let len = payload.len() as u32;
            let unacked = slot.shared.unacked.fetch_add(len, Ordering::SeqCst) + len;
            if unacked > self.window {
                true
            } else {
                slot.shared
                    .bytes_received
                    .fetch_add(len as u64, Ordering::Relaxed);
                let _ = tx.send(Inbound::Data(payload));
                false
            }
        };

        if violated {
            warn!("Stream {} exceeded its receive window, resetting", stream_id);
            self.reset(stream_id).await;
        }
    }

    async fn reset(&self, stream_id: StreamId) {
        if let Some((_, slot)) = self.streams.remove(&stream_id) {
            slot.abort(ABORT_RESET);
            let _ = self.outbound.send(Frame::Reset { stream_id }).await;
        }
    }

    /// Abort every stream. Used when the session goes away; nothing is sent
    /// to the peer.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut aborted = 0usize;
        self.streams.retain(|_, slot| {
            slot.abort(ABORT_SESSION);
            aborted += 1;
            false
        });
        if aborted > 0 {
            debug!("Multiplexer shut down, aborted {} streams", aborted);
        }
    }

    fn release(&self, stream_id: StreamId) {
        let Some((_, slot)) = self.streams.remove(&stream_id) else {
            return;
        };
        let shared = &slot.shared;
        if shared.abort.load(Ordering::SeqCst) != ABORT_NONE || self.is_closed() {
            return;
        }

        let finished = shared.local_closed.load(Ordering::SeqCst)
            && shared.remote_closed.load(Ordering::SeqCst);
        if finished {
            trace!("Released stream {}", stream_id);
            return;
        }

        // The peer still thinks the stream is open.
        match self.outbound.try_send(Frame::Reset { stream_id }) {
            Ok(()) => debug!("Released unfinished stream {}", stream_id),
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Unregisters the stream once both halves are dropped.
struct StreamGuard {
    id: StreamId,
    mux: Arc<Multiplexer>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.mux.release(self.id);
    }
}

/// Read-only view of a stream's counters.
#[derive(Clone)]
pub struct StreamMeter(Arc<StreamShared>);

impl StreamMeter {
    pub fn stats(&self) -> StreamStats {
        self.0.stats()
    }
}

/// A bidirectional multiplexed stream.
pub struct MuxStream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl MuxStream {
    fn new(
        shared: Arc<StreamShared>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        mux: Arc<Multiplexer>,
    ) -> Self {
        let guard = Arc::new(StreamGuard {
            id: shared.id,
            mux: mux.clone(),
        });
        Self {
            reader: StreamReader {
                shared: shared.clone(),
                inbound,
                outbound: mux.outbound.clone(),
                ack_threshold: (mux.window / 4).max(1),
                pending_ack: 0,
                _guard: guard.clone(),
            },
            writer: StreamWriter {
                shared,
                outbound: mux.outbound.clone(),
                _guard: guard,
            },
        }
    }

    pub fn id(&self) -> StreamId {
        self.writer.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.writer.shared.state()
    }

    pub fn stats(&self) -> StreamStats {
        self.writer.shared.stats()
    }

    /// Handle on the byte counters that outlives the stream itself.
    pub fn meter(&self) -> StreamMeter {
        StreamMeter(self.writer.shared.clone())
    }

    /// Read the next chunk. `Ok(None)` means the peer half-closed.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.reader.read().await
    }

    /// Write bytes, waiting for send credit as needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    /// Half-close the local direction.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.writer.close().await
    }

    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`MuxStream`].
pub struct StreamReader {
    shared: Arc<StreamShared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::Sender<Frame>,
    ack_threshold: u32,
    pending_ack: u32,
    _guard: Arc<StreamGuard>,
}

impl StreamReader {
    /// Read the next chunk. `Ok(None)` means the peer half-closed.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        match self.inbound.recv().await {
            Some(Inbound::Data(chunk)) => {
                self.acknowledge(chunk.len() as u32).await;
                Ok(Some(chunk))
            }
            Some(Inbound::Abort) => Err(self.shared.abort_error()),
            // A reset that follows the peer's close only cancels our writer;
            // everything the peer sent has already been delivered.
            None => match self.shared.abort.load(Ordering::SeqCst) {
                ABORT_NONE => Ok(None),
                ABORT_RESET if self.shared.remote_closed.load(Ordering::SeqCst) => Ok(None),
                _ => Err(self.shared.abort_error()),
            },
        }
    }

    /// Return credit for consumed bytes once enough has accumulated.
    async fn acknowledge(&mut self, consumed: u32) {
        self.pending_ack += consumed;
        if self.pending_ack < self.ack_threshold {
            return;
        }

        let increment = std::mem::take(&mut self.pending_ack);
        self.shared.unacked.fetch_sub(increment, Ordering::SeqCst);
        if self.shared.remote_closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .outbound
            .send(Frame::WindowUpdate {
                stream_id: self.shared.id,
                increment,
            })
            .await;
    }
}

/// Sending half of a [`MuxStream`].
pub struct StreamWriter {
    shared: Arc<StreamShared>,
    outbound: mpsc::Sender<Frame>,
    _guard: Arc<StreamGuard>,
}

impl StreamWriter {
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats()
    }

    /// Write bytes, waiting for send credit as needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.shared.local_closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }

        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let permit = self
                .shared
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| self.shared.abort_error())?;
            permit.forget();

            self.outbound
                .send(Frame::Data {
                    stream_id: self.shared.id,
                    payload: chunk.to_vec(),
                })
                .await
                .map_err(|_| StreamError::Closed)?;
            self.shared
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Half-close the local direction. Idempotent.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        if self.shared.local_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.abort.load(Ordering::SeqCst) != ABORT_NONE {
            return Err(self.shared.abort_error());
        }
        self.outbound
            .send(Frame::Close {
                stream_id: self.shared.id,
            })
            .await
            .map_err(|_| StreamError::Closed)
    }
}
