//! QUIC transport seam.
//!
//! The HTTP/3 layer never touches packets. It needs a connection that can
//! open streams and be closed with an application error code, and streams
//! that expose their byte halves plus the two cancellation signals QUIC
//! offers (STOP_SENDING and RESET_STREAM).

pub mod memory;

use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Receiving half of a QUIC stream.
pub type RecvHalf = Box<dyn AsyncRead + Send + Unpin>;

/// Sending half of a QUIC stream. `poll_shutdown` sends FIN.
pub type SendHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Cancellation signals of a single QUIC stream.
///
/// Held separately from the byte halves so that a stream can be cancelled
/// while another task is blocked reading or writing it.
pub trait StreamControl: Send + Sync {
    /// Ask the peer to stop sending (STOP_SENDING).
    fn abort_reading(&self, error_code: u64);

    /// Abandon the sending side (RESET_STREAM).
    fn reset_stream(&self, error_code: u64);
}

/// A QUIC stream handed to or opened by the HTTP/3 layer.
pub struct QuicStream {
    /// Stream identifier
    pub id: u64,
    /// Whether the stream is bidirectional
    pub is_bidirectional: bool,
    recv: Option<RecvHalf>,
    send: Option<SendHalf>,
    control: Arc<dyn StreamControl>,
}

impl QuicStream {
    /// Create a stream from its parts.
    ///
    /// A locally opened unidirectional stream has only a send half, a peer
    /// opened one only a receive half.
    pub fn new(
        id: u64,
        recv: Option<RecvHalf>,
        send: Option<SendHalf>,
        control: Arc<dyn StreamControl>,
    ) -> Self {
        Self {
            id,
            is_bidirectional: recv.is_some() && send.is_some(),
            recv,
            send,
            control,
        }
    }

    /// Kind of stream, derived from the id.
    pub fn kind(&self) -> StreamKind {
        StreamKind::from_id(self.id)
    }

    pub fn control(&self) -> Arc<dyn StreamControl> {
        Arc::clone(&self.control)
    }

    /// Split into the receive half, send half and control handle.
    pub fn into_parts(self) -> (Option<RecvHalf>, Option<SendHalf>, Arc<dyn StreamControl>) {
        (self.recv, self.send, self.control)
    }
}

impl fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicStream")
            .field("id", &self.id)
            .field("bidirectional", &self.is_bidirectional)
            .field("recv", &self.recv.is_some())
            .field("send", &self.send.is_some())
            .finish()
    }
}

/// Stream type classification (RFC 9000 section 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Client-initiated bidirectional stream
    ClientBidirectional,
    /// Server-initiated bidirectional stream
    ServerBidirectional,
    /// Client-initiated unidirectional stream
    ClientUnidirectional,
    /// Server-initiated unidirectional stream
    ServerUnidirectional,
}

impl StreamKind {
    /// Determine stream type from stream ID.
    pub fn from_id(stream_id: u64) -> Self {
        match stream_id & 0x03 {
            0x00 => StreamKind::ClientBidirectional,
            0x01 => StreamKind::ServerBidirectional,
            0x02 => StreamKind::ClientUnidirectional,
            _ => StreamKind::ServerUnidirectional,
        }
    }

    /// Check if this stream type is bidirectional.
    pub fn is_bidirectional(self) -> bool {
        matches!(
            self,
            StreamKind::ClientBidirectional | StreamKind::ServerBidirectional
        )
    }

    /// Check if this stream type is client-initiated.
    pub fn is_client_initiated(self) -> bool {
        matches!(
            self,
            StreamKind::ClientBidirectional | StreamKind::ClientUnidirectional
        )
    }
}

/// Counters reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub streams_opened: u64,
    pub streams_accepted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A QUIC connection as seen by the HTTP/3 layer.
///
/// Peer-initiated streams are not pulled from here; the transport pushes
/// them into `H3Client::accept_stream` / `H3Server::accept_stream`.
pub trait QuicConnection: Send + Sync + 'static {
    /// Open a new locally initiated stream.
    fn open_stream(&self, bidirectional: bool) -> BoxFuture<'_, io::Result<QuicStream>>;

    /// Close the connection with an application error code.
    fn close(&self, error_code: u64, reason: &str);

    /// Transport statistics.
    fn stats(&self) -> ConnectionStats;
}
