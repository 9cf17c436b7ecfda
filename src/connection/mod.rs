//! Connection core shared by client and server.
//!
//! Owns the local and peer SETTINGS, the control stream and the dispatch
//! tables for peer-initiated streams. Each peer stream is handled on its own
//! task; connection-level failures close the QUIC connection with the
//! matching HTTP/3 error code.

mod registry;

pub use registry::Registry;

use crate::config::MessageLimits;
use crate::error::{codes, CapabilityError, ConnectionError, H3Error, H3Result};
use crate::protocol::frame::H3Frame;
use crate::protocol::qpack::HeaderCodec;
use crate::protocol::settings::{SettingId, Settings};
use crate::protocol::stream::{HttpStream, StreamReader, StreamWriter};
use crate::protocol::varint;
use crate::transport::{QuicConnection, QuicStream, StreamControl};
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Unidirectional stream type prefixes.
pub mod stream_type {
    pub const CONTROL: u64 = 0x00;
    pub const PUSH: u64 = 0x01;
    pub const QPACK_ENCODER: u64 = 0x02;
    pub const QPACK_DECODER: u64 = 0x03;
    pub const WEBTRANSPORT: u64 = 0x54;
}

/// Signal value opening a WebTransport bidirectional stream.
pub const WEBTRANSPORT_BIDI_SIGNAL: u64 = 0x41;

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Handles a peer unidirectional stream of a registered type.
pub trait UniStreamHandler: Send + Sync + 'static {
    /// `reader` is positioned just after the stream type.
    fn handle_stream(
        &self,
        stream_type: u64,
        reader: StreamReader,
        control: Arc<dyn StreamControl>,
    ) -> BoxFuture<'_, H3Result<()>>;
}

/// Handles a peer bidirectional stream whose leading varint matched.
pub trait BidiStreamHandler: Send + Sync + 'static {
    /// The leading varint (`signal`) has been peeked but not consumed.
    fn handle_stream(&self, signal: u64, stream: HttpStream) -> BoxFuture<'_, H3Result<()>>;
}

#[derive(Debug)]
struct LocalSettings {
    settings: Settings,
    started: bool,
}

/// State shared by every task working on one HTTP/3 connection.
pub struct ConnectionCore {
    role: Role,
    transport: Arc<dyn QuicConnection>,
    codec: Arc<dyn HeaderCodec>,
    limits: MessageLimits,
    local: Mutex<LocalSettings>,
    peer_settings: watch::Sender<Option<Arc<Settings>>>,
    control_stream_seen: AtomicBool,
    control_writer: tokio::sync::Mutex<Option<StreamWriter>>,
    peer_goaway: Mutex<Option<u64>>,
    closed: AtomicBool,
    uni_handlers: Registry<u64, Arc<dyn UniStreamHandler>>,
    bidi_handlers: Registry<u64, Arc<dyn BidiStreamHandler>>,
}

impl ConnectionCore {
    pub fn new(
        role: Role,
        transport: Arc<dyn QuicConnection>,
        codec: Arc<dyn HeaderCodec>,
        limits: MessageLimits,
        settings: Settings,
    ) -> Arc<Self> {
        let (peer_settings, _) = watch::channel(None);
        Arc::new(Self {
            role,
            transport,
            codec,
            limits,
            local: Mutex::new(LocalSettings {
                settings,
                started: false,
            }),
            peer_settings,
            control_stream_seen: AtomicBool::new(false),
            control_writer: tokio::sync::Mutex::new(None),
            peer_goaway: Mutex::new(None),
            closed: AtomicBool::new(false),
            uni_handlers: Registry::new(),
            bidi_handlers: Registry::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &Arc<dyn QuicConnection> {
        &self.transport
    }

    pub fn codec(&self) -> &Arc<dyn HeaderCodec> {
        &self.codec
    }

    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    /// Add or replace a local setting. Only allowed before [`start`](Self::start).
    pub fn add_setting(&self, id: impl Into<u64>, value: u64) -> H3Result<()> {
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        if local.started {
            return Err(H3Error::illegal_state(
                "settings cannot change after the connection has started",
            ));
        }
        local.settings.insert(id, value);
        Ok(())
    }

    /// Add a reserved setting with a random identifier and value.
    pub fn add_grease_setting(&self) -> H3Result<()> {
        let mut rng = rand::thread_rng();
        let id = 0x1f * rng.gen_range(0..(1u64 << 32)) + 0x21;
        let value = rng.gen_range(0..(1u64 << 30));
        self.add_setting(id, value)
    }

    /// Snapshot of the local settings.
    pub fn local_settings(&self) -> Settings {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .clone()
    }

    /// Open the control stream and send SETTINGS.
    pub async fn start(&self) -> H3Result<()> {
        let settings = {
            let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
            if local.started {
                return Err(H3Error::illegal_state("connection already started"));
            }
            local.started = true;
            local.settings.clone()
        };

        let stream = self.transport.open_stream(false).await?;
        let mut stream = HttpStream::new(stream, self.limits.max_frame_size);
        let mut writer = stream.take_writer()?;

        let count = settings.len();
        let frame = H3Frame::Settings(settings);
        let mut buf = BytesMut::with_capacity(1 + frame.encoded_len());
        varint::encode(stream_type::CONTROL, &mut buf)?;
        frame.encode(&mut buf)?;
        writer.write_all(&buf).await?;
        *self.control_writer.lock().await = Some(writer);

        tracing::info!(
            "HTTP/3 {} started, sent {} settings on control stream {}",
            self.role,
            count,
            stream.id
        );
        Ok(())
    }

    /// Send GOAWAY on the control stream.
    pub async fn send_goaway(&self, id: u64) -> H3Result<()> {
        let mut writer = self.control_writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| H3Error::illegal_state("connection not started"))?;
        writer.write_frame(&H3Frame::Goaway(id)).await?;
        tracing::info!("Sent GOAWAY({}) from {}", id, self.role);
        Ok(())
    }

    /// Peer settings, once received.
    pub fn peer_settings(&self) -> Option<Arc<Settings>> {
        self.peer_settings.borrow().clone()
    }

    /// Wait until the peer's SETTINGS frame has been parsed.
    pub async fn wait_for_settings(&self, timeout: Duration) -> H3Result<Arc<Settings>> {
        let mut rx = self.peer_settings.subscribe();
        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(settings) = current {
                    return Ok(settings);
                }
                if rx.changed().await.is_err() {
                    return Err(H3Error::from(ConnectionError::Closed));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CapabilityError::SettingsTimeout)?
    }

    /// Stream id from the peer's GOAWAY, if one was received.
    pub fn peer_goaway(&self) -> Option<u64> {
        *self.peer_goaway.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail if new requests can no longer be started.
    pub fn check_open(&self) -> H3Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        if let Some(id) = self.peer_goaway() {
            return Err(ConnectionError::GoingAway(id).into());
        }
        Ok(())
    }

    /// Close the QUIC connection with the code for `error`.
    pub fn close_with_error(&self, error: &H3Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("Closing HTTP/3 {} connection: {}", self.role, error);
        self.transport.close(error.error_code(), &error.to_string());
    }

    /// Close the QUIC connection without error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Closing HTTP/3 {} connection", self.role);
        self.transport.close(codes::H3_NO_ERROR, "");
    }

    pub fn register_uni_handler(&self, stream_type: u64, handler: Arc<dyn UniStreamHandler>) {
        self.uni_handlers.register(stream_type, handler);
    }

    pub fn register_bidi_handler(&self, signal: u64, handler: Arc<dyn BidiStreamHandler>) {
        self.bidi_handlers.register(signal, handler);
    }

    /// Open a bidirectional stream for a request or session.
    pub async fn open_bidi(&self) -> H3Result<HttpStream> {
        let stream = self.transport.open_stream(true).await?;
        Ok(HttpStream::new(stream, self.limits.max_frame_size))
    }

    /// Open a unidirectional stream.
    pub async fn open_uni(&self) -> H3Result<HttpStream> {
        let stream = self.transport.open_stream(false).await?;
        Ok(HttpStream::new(stream, self.limits.max_frame_size))
    }

    /// Handle a peer-initiated stream on its own task.
    ///
    /// `default_bidi` handles bidirectional streams no registered handler
    /// claims; without one they are refused.
    pub fn accept_stream(
        self: &Arc<Self>,
        stream: QuicStream,
        default_bidi: Option<Arc<dyn BidiStreamHandler>>,
    ) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let id = stream.id;
            let control = stream.control();
            let result = if stream.is_bidirectional {
                core.handle_bidi(stream, default_bidi).await
            } else {
                core.handle_uni(stream).await
            };
            if let Err(e) = result {
                core.on_stream_error(id, control.as_ref(), &e);
            }
        });
    }

    /// Accept every stream from `incoming` until it ends.
    pub async fn serve<S>(
        self: &Arc<Self>,
        mut incoming: S,
        default_bidi: Option<Arc<dyn BidiStreamHandler>>,
    ) where
        S: Stream<Item = QuicStream> + Unpin,
    {
        while let Some(stream) = incoming.next().await {
            self.accept_stream(stream, default_bidi.clone());
        }
        tracing::debug!("Incoming stream source for {} ended", self.role);
    }

    fn on_stream_error(&self, id: u64, control: &dyn StreamControl, error: &H3Error) {
        if error.should_close_connection() {
            self.close_with_error(error);
        } else if !error.is_local() {
            tracing::debug!("Stream {} failed: {}", id, error);
            control.abort_reading(error.error_code());
            control.reset_stream(error.error_code());
        } else {
            tracing::warn!("Stream {} handler misuse: {}", id, error);
        }
    }

    async fn handle_uni(&self, stream: QuicStream) -> H3Result<()> {
        let mut stream = HttpStream::new(stream, self.limits.max_frame_size);
        let control = stream.control();
        let mut reader = stream.take_reader()?;
        let Some(kind) = reader.read_varint().await? else {
            return Ok(());
        };
        tracing::debug!("Peer unidirectional stream {} of type {:#x}", stream.id, kind);

        match kind {
            stream_type::CONTROL => {
                if let Err(e) = self.run_control_stream(reader).await {
                    self.close_with_error(&e);
                }
                Ok(())
            }
            stream_type::QPACK_ENCODER | stream_type::QPACK_DECODER => {
                let drained = reader.drain().await?;
                tracing::debug!("QPACK stream {} ended after {} bytes", stream.id, drained);
                Ok(())
            }
            other => match self.uni_handlers.get(&other) {
                Some(handler) => handler.handle_stream(other, reader, control).await,
                None => {
                    control.abort_reading(codes::H3_STREAM_CREATION_ERROR);
                    Ok(())
                }
            },
        }
    }

    async fn run_control_stream(&self, mut reader: StreamReader) -> H3Result<()> {
        if self.control_stream_seen.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::StreamCreation("second control stream".into()).into());
        }

        let settings = match reader.read_frame().await {
            Ok(Some(H3Frame::Settings(settings))) => settings,
            Ok(Some(_)) => return Err(ConnectionError::MissingSettings.into()),
            Ok(None) => {
                return Err(ConnectionError::ClosedCriticalStream("control".into()).into());
            }
            Err(e) => return Err(promote(e)),
        };
        tracing::info!(
            "HTTP/3 {} received peer settings: extended CONNECT {}, WebTransport sessions {}",
            self.role,
            settings.enable_connect_protocol(),
            settings.get(SettingId::WebTransportMaxSessions).unwrap_or(0)
        );
        self.peer_settings.send_replace(Some(Arc::new(settings)));

        loop {
            match reader.read_frame().await.map_err(promote)? {
                Some(H3Frame::Goaway(id)) => {
                    tracing::info!("Peer sent GOAWAY({})", id);
                    *self.peer_goaway.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
                }
                Some(H3Frame::Unknown { frame_type, .. }) => {
                    tracing::debug!("Ignoring frame {:#x} on control stream", frame_type);
                }
                Some(frame) => {
                    return Err(ConnectionError::FrameUnexpected(frame.frame_type()).into());
                }
                None => {
                    return Err(ConnectionError::ClosedCriticalStream("control".into()).into());
                }
            }
        }
    }

    async fn handle_bidi(
        &self,
        stream: QuicStream,
        default_bidi: Option<Arc<dyn BidiStreamHandler>>,
    ) -> H3Result<()> {
        let mut stream = HttpStream::new(stream, self.limits.max_frame_size);
        let signal = match stream.reader.as_mut() {
            Some(reader) => reader.peek_varint().await?,
            None => None,
        };
        let Some(signal) = signal else {
            return Ok(());
        };

        if let Some(handler) = self.bidi_handlers.get(&signal) {
            tracing::debug!("Bidirectional stream {} claimed by signal {:#x}", stream.id, signal);
            return handler.handle_stream(signal, stream).await;
        }
        match default_bidi {
            Some(handler) => handler.handle_stream(signal, stream).await,
            None => {
                tracing::debug!("Refusing peer bidirectional stream {}", stream.id);
                stream.abort_reading(codes::H3_STREAM_CREATION_ERROR);
                stream.reset_stream(codes::H3_STREAM_CREATION_ERROR);
                Ok(())
            }
        }
    }
}

/// Errors on a critical stream take the whole connection down.
fn promote(error: H3Error) -> H3Error {
    match error {
        H3Error::Connection(_) => error,
        H3Error::Parse(e) => ConnectionError::Frame(e.to_string()).into(),
        other => ConnectionError::ClosedCriticalStream(other.to_string()).into(),
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .field("peer_settings", &self.peer_settings().is_some())
            .finish()
    }
}
