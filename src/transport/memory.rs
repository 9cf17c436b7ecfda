//! In-memory loopback transport.
//!
//! Each stream is a `tokio::io::duplex` pipe. Cancellation signals are
//! recorded rather than acted upon so that callers can inspect them.

use super::{ConnectionStats, QuicConnection, QuicStream, StreamControl};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type ControlMap = Arc<Mutex<HashMap<u64, Arc<MemoryStreamControl>>>>;

/// Records STOP_SENDING and RESET_STREAM calls on one stream end.
#[derive(Debug, Default)]
pub struct MemoryStreamControl {
    aborted: Mutex<Option<u64>>,
    reset: Mutex<Option<u64>>,
}

impl MemoryStreamControl {
    /// Error code passed to `abort_reading`, if any.
    pub fn abort_code(&self) -> Option<u64> {
        *self.aborted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Error code passed to `reset_stream`, if any.
    pub fn reset_code(&self) -> Option<u64> {
        *self.reset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamControl for MemoryStreamControl {
    fn abort_reading(&self, error_code: u64) {
        let mut aborted = self.aborted.lock().unwrap_or_else(PoisonError::into_inner);
        aborted.get_or_insert(error_code);
    }

    fn reset_stream(&self, error_code: u64) {
        let mut reset = self.reset.lock().unwrap_or_else(PoisonError::into_inner);
        reset.get_or_insert(error_code);
    }
}

/// One side of an in-memory connection.
pub struct MemoryConnection {
    is_client: bool,
    next_bidi: AtomicU64,
    next_uni: AtomicU64,
    to_peer: mpsc::UnboundedSender<QuicStream>,
    controls: ControlMap,
    peer_controls: ControlMap,
    closed: Mutex<Option<(u64, String)>>,
    streams_opened: AtomicU64,
    streams_accepted: Arc<AtomicU64>,
    peer_streams_accepted: Arc<AtomicU64>,
    pipe_capacity: usize,
}

/// A connection side together with the streams its peer opens.
pub struct MemoryEndpoint {
    pub connection: Arc<MemoryConnection>,
    pub incoming: mpsc::UnboundedReceiver<QuicStream>,
}

/// Create a connected client/server pair.
pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (to_server, server_incoming) = mpsc::unbounded();
    let (to_client, client_incoming) = mpsc::unbounded();
    let client_controls: ControlMap = Arc::default();
    let server_controls: ControlMap = Arc::default();
    let client_accepted = Arc::new(AtomicU64::new(0));
    let server_accepted = Arc::new(AtomicU64::new(0));

    let client = MemoryConnection {
        is_client: true,
        next_bidi: AtomicU64::new(0),
        next_uni: AtomicU64::new(2),
        to_peer: to_server,
        controls: Arc::clone(&client_controls),
        peer_controls: Arc::clone(&server_controls),
        closed: Mutex::new(None),
        streams_opened: AtomicU64::new(0),
        streams_accepted: Arc::clone(&client_accepted),
        peer_streams_accepted: Arc::clone(&server_accepted),
        pipe_capacity: DEFAULT_PIPE_CAPACITY,
    };
    let server = MemoryConnection {
        is_client: false,
        next_bidi: AtomicU64::new(1),
        next_uni: AtomicU64::new(3),
        to_peer: to_client,
        controls: server_controls,
        peer_controls: client_controls,
        closed: Mutex::new(None),
        streams_opened: AtomicU64::new(0),
        streams_accepted: server_accepted,
        peer_streams_accepted: client_accepted,
        pipe_capacity: DEFAULT_PIPE_CAPACITY,
    };

    (
        MemoryEndpoint {
            connection: Arc::new(client),
            incoming: client_incoming,
        },
        MemoryEndpoint {
            connection: Arc::new(server),
            incoming: server_incoming,
        },
    )
}

impl MemoryConnection {
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Control handle of this side's end of stream `id`.
    pub fn stream_control(&self, id: u64) -> Option<Arc<MemoryStreamControl>> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Error code and reason the connection was closed with, if closed.
    pub fn close_reason(&self) -> Option<(u64, String)> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn register(map: &ControlMap, id: u64) -> Arc<MemoryStreamControl> {
        let control = Arc::new(MemoryStreamControl::default());
        map.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&control));
        control
    }

    fn open(&self, bidirectional: bool) -> io::Result<QuicStream> {
        if self.close_reason().is_some() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let counter = if bidirectional { &self.next_bidi } else { &self.next_uni };
        let id = counter.fetch_add(4, Ordering::Relaxed);

        let (local_io, remote_io) = tokio::io::duplex(self.pipe_capacity);
        let (local_recv, local_send) = tokio::io::split(local_io);
        let (remote_recv, remote_send) = tokio::io::split(remote_io);
        let local_control = Self::register(&self.controls, id);
        let remote_control = Self::register(&self.peer_controls, id);

        let (local, remote) = if bidirectional {
            (
                QuicStream::new(id, Some(Box::new(local_recv)), Some(Box::new(local_send)), local_control),
                QuicStream::new(id, Some(Box::new(remote_recv)), Some(Box::new(remote_send)), remote_control),
            )
        } else {
            (
                QuicStream::new(id, None, Some(Box::new(local_send)), local_control),
                QuicStream::new(id, Some(Box::new(remote_recv)), None, remote_control),
            )
        };

        self.to_peer
            .unbounded_send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "peer is gone"))?;
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.peer_streams_accepted.fetch_add(1, Ordering::Relaxed);
        Ok(local)
    }
}

impl QuicConnection for MemoryConnection {
    fn open_stream(&self, bidirectional: bool) -> BoxFuture<'_, io::Result<QuicStream>> {
        Box::pin(async move { self.open(bidirectional) })
    }

    fn close(&self, error_code: u64, reason: &str) {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if closed.is_none() {
            tracing::debug!("Memory connection closed: {:#x} {}", error_code, reason);
            *closed = Some((error_code, reason.to_string()));
        }
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            ..ConnectionStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bidirectional_loopback() {
        let (client, mut server) = pair();
        let stream = client.connection.open_stream(true).await.unwrap();
        assert_eq!(stream.id, 0);
        assert!(stream.is_bidirectional);

        let peer = server.incoming.next().await.unwrap();
        assert_eq!(peer.id, 0);

        let (_, send, _) = stream.into_parts();
        let (recv, _, _) = peer.into_parts();
        let mut send = send.unwrap();
        let mut recv = recv.unwrap();
        send.write_all(b"ping").await.unwrap();
        send.shutdown().await.unwrap();

        let mut buf = Vec::new();
        recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn test_unidirectional_ids_and_controls() {
        let (client, server) = pair();
        let first = server.connection.open_stream(false).await.unwrap();
        let second = server.connection.open_stream(false).await.unwrap();
        assert_eq!((first.id, second.id), (3, 7));
        assert!(!first.is_bidirectional);

        first.control().reset_stream(0x10c);
        let control = server.connection.stream_control(3).unwrap();
        assert_eq!(control.reset_code(), Some(0x10c));
        assert_eq!(control.abort_code(), None);
        assert!(client.connection.stream_control(3).is_some());

        assert_eq!(server.connection.stats().streams_opened, 2);
        assert_eq!(client.connection.stats().streams_accepted, 2);
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_streams() {
        let (client, _server) = pair();
        client.connection.close(0x100, "done");
        client.connection.close(0x101, "again");
        assert_eq!(client.connection.close_reason(), Some((0x100, "done".to_string())));
        assert!(client.connection.open_stream(true).await.is_err());
    }
}
