//! Byte relay between a multiplexed stream and a socket.
//!
//! Used by the broker (public connection side) and by the client (forward
//! target side). Both directions run concurrently; EOF on one side becomes a
//! half-close on the other.

use crate::multiplex::{MuxStream, StreamError, StreamStats, MAX_FRAME_PAYLOAD};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Tracks the last time bytes moved in either direction.
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Resolves once no bytes moved for `timeout`.
    async fn idle(&self, timeout: Duration) {
        loop {
            let elapsed = self.last.lock().elapsed();
            if elapsed >= timeout {
                return;
            }
            tokio::time::sleep(timeout - elapsed).await;
        }
    }
}

/// Relay until both directions finish, either side fails, or no bytes move
/// for `idle_timeout`.
///
/// Dropping the stream on error resets it towards the peer.
pub async fn relay<T>(
    stream: MuxStream,
    io: T,
    idle_timeout: Duration,
) -> Result<StreamStats, StreamError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let stream_id = stream.id();
    let (mut reader, mut writer) = stream.split();
    let (mut io_read, mut io_write) = tokio::io::split(io);
    let activity = Activity::new();

    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = io_read.read(&mut buf).await?;
            if n == 0 {
                trace!("Stream {} local side finished", stream_id);
                writer.close().await?;
                return Ok::<_, StreamError>(());
            }
            activity.touch();
            writer.write(&buf[..n]).await?;
        }
    };

    let downstream = async {
        while let Some(chunk) = reader.read().await? {
            activity.touch();
            io_write.write_all(&chunk).await?;
        }
        trace!("Stream {} remote side finished", stream_id);
        io_write.shutdown().await?;
        Ok::<_, StreamError>(())
    };

    tokio::select! {
        result = async { tokio::try_join!(upstream, downstream) } => {
            result?;
        }
        _ = activity.idle(idle_timeout) => {
            return Err(StreamError::IdleTimeout);
        }
    }

    Ok(writer.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplex::{Multiplexer, Role, OUTBOUND_QUEUE};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Server and client multiplexers joined in memory.
    fn joined() -> (Arc<Multiplexer>, mpsc::UnboundedReceiver<MuxStream>) {
        let (server_tx, mut server_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (client_tx, mut client_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let server = Multiplexer::new(Role::Server, server_tx);
        let client = Multiplexer::new(Role::Client, client_tx);
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let c = client.clone();
        tokio::spawn(async move {
            while let Some(frame) = server_rx.recv().await {
                if let Some(accepted) = c.handle_frame(frame).await {
                    let _ = accepted_tx.send(accepted.stream);
                }
            }
        });
        let s = server.clone();
        tokio::spawn(async move {
            while let Some(frame) = client_rx.recv().await {
                s.handle_frame(frame).await;
            }
        });

        (server, accepted_rx)
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let (server, mut accepted) = joined();

        // Client side relays the stream into an in-memory echo peer.
        let (relay_end, mut echo_end) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let n = echo_end.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                echo_end.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut public = server.open(None).await.unwrap();
        let remote = accepted.recv().await.unwrap();
        let relay_task =
            tokio::spawn(async move { relay(remote, relay_end, Duration::from_secs(5)).await });

        public.write(b"ping").await.unwrap();
        assert_eq!(public.read().await.unwrap().unwrap(), b"ping");

        public.close().await.unwrap();
        assert!(public.read().await.unwrap().is_none());

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (server, mut accepted) = joined();

        let (relay_end, _silent_end) = tokio::io::duplex(1024);
        let mut public = server.open(None).await.unwrap();
        let remote = accepted.recv().await.unwrap();

        let result = relay(remote, relay_end, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StreamError::IdleTimeout)));

        // The aborted stream is reset towards the other side.
        assert!(matches!(public.read().await, Err(StreamError::Reset)));
    }
}
