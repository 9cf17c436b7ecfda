//! HTTP/3 client implementation.

use crate::config::ClientConfig;
use crate::connection::{ConnectionCore, Role};
use crate::error::{codes, CapabilityError, H3Error, H3Result, ProtocolError};
use crate::protocol::frame::H3Frame;
use crate::protocol::headers::{FieldSection, HeaderField, Headers, PseudoHeaders};
use crate::protocol::qpack::{HeaderCodec, StaticQpack};
use crate::protocol::settings::{SettingId, Settings};
use crate::protocol::stream::{MessagePart, MessageReader, StreamReader, StreamWriter};
use crate::protocol::{Body, H3Request, H3Response};
use crate::transport::{QuicConnection, QuicStream, StreamControl};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::StatusCode;
use std::fmt;
use std::sync::Arc;

/// HTTP/3 client for sending requests over one QUIC connection.
#[derive(Clone)]
pub struct H3Client {
    /// Client configuration
    config: ClientConfig,
    core: Arc<ConnectionCore>,
}

impl H3Client {
    /// Create a client over `transport` with the built-in header codec.
    pub fn new(transport: Arc<dyn QuicConnection>, config: ClientConfig) -> H3Result<Self> {
        Self::with_codec(transport, config, Arc::new(StaticQpack))
    }

    /// Create a client with a custom header codec.
    pub fn with_codec(
        transport: Arc<dyn QuicConnection>,
        config: ClientConfig,
        codec: Arc<dyn HeaderCodec>,
    ) -> H3Result<Self> {
        config.validate()?;
        let mut settings = Settings::new();
        if config.qpack_max_table_capacity > 0 {
            settings.insert(SettingId::QpackMaxTableCapacity, config.qpack_max_table_capacity);
        }
        if config.qpack_blocked_streams > 0 {
            settings.insert(SettingId::QpackBlockedStreams, config.qpack_blocked_streams);
        }
        if config.enable_webtransport {
            settings.insert(SettingId::H3Datagram, 1);
            settings.insert(SettingId::WebTransportMaxSessions, 1);
        }
        let core = ConnectionCore::new(Role::Client, transport, codec, config.limits, settings);
        if config.send_grease {
            core.add_grease_setting()?;
        }
        Ok(Self { config, core })
    }

    /// Create a client and start it.
    pub async fn connect(transport: Arc<dyn QuicConnection>, config: ClientConfig) -> H3Result<Self> {
        let client = Self::new(transport, config)?;
        tracing::info!("Connecting HTTP/3 client");
        client.start().await?;
        Ok(client)
    }

    /// Open the control stream and send SETTINGS.
    pub async fn start(&self) -> H3Result<()> {
        self.core.start().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The shared connection state.
    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// Hand a peer-initiated stream to the client.
    pub fn accept_stream(&self, stream: QuicStream) {
        self.core.accept_stream(stream, None);
    }

    /// Accept peer-initiated streams until `incoming` ends.
    pub async fn serve<S>(&self, incoming: S)
    where
        S: Stream<Item = QuicStream> + Unpin,
    {
        self.core.serve(incoming, None).await;
    }

    /// Send an HTTP/3 request and wait for the complete response.
    pub async fn send_request(&self, request: H3Request) -> H3Result<H3Response> {
        self.send_request_stream(request).await?.collect().await
    }

    /// Send an HTTP/3 request and return once the response headers arrive.
    pub async fn send_request_stream(&self, request: H3Request) -> H3Result<ResponseStream> {
        self.core.check_open()?;
        let section = request.to_field_section()?;
        tracing::debug!("Sending request: {} {}", request.method, request.uri);

        let mut stream = self.core.open_bidi().await?;
        let control = stream.control();
        let mut writer = stream.take_writer()?;
        let reader = stream.take_reader()?;

        writer.write_headers(self.core.codec().as_ref(), &section).await?;
        if let Some(mut body) = request.body {
            while let Some(chunk) = body.next_chunk().await? {
                writer.write_frame(&H3Frame::Data(chunk)).await?;
            }
        }
        writer.finish().await?;

        let mut message = MessageReader::new(reader, Arc::clone(self.core.codec()), self.core.limits());
        let (status, headers) = match read_final_headers(&mut message).await {
            Ok(head) => head,
            Err(e) => {
                reset_locally(&self.core, control.as_ref(), &e);
                return Err(e);
            }
        };
        tracing::debug!("Response on stream {}: {}", stream.id, status);

        Ok(ResponseStream {
            stream_id: stream.id,
            status,
            headers,
            trailers: None,
            message,
            core: Arc::clone(&self.core),
            control,
            chunk_size: self.config.response_chunk_size,
            pending: Bytes::new(),
            finished: false,
        })
    }

    /// Open a CONNECT tunnel to `authority`.
    pub async fn send_connect(&self, authority: &str) -> H3Result<ConnectStream> {
        let section = FieldSection {
            pseudo: PseudoHeaders {
                method: Some("CONNECT".into()),
                authority: Some(authority.to_string()),
                ..PseudoHeaders::default()
            },
            headers: Headers::new(),
        };
        self.connect_with(section).await
    }

    /// Open an Extended CONNECT stream for `protocol`.
    ///
    /// Waits for the server's SETTINGS and fails unless it enabled the
    /// CONNECT protocol.
    pub async fn send_extended_connect(
        &self,
        authority: &str,
        protocol: &str,
        scheme: &str,
        path: &str,
        headers: Headers,
    ) -> H3Result<ConnectStream> {
        let settings = self
            .core
            .wait_for_settings(self.config.settings_timeout)
            .await?;
        if !settings.enable_connect_protocol() {
            return Err(CapabilityError::ExtendedConnectUnsupported.into());
        }
        let section = FieldSection {
            pseudo: PseudoHeaders {
                method: Some("CONNECT".into()),
                protocol: Some(protocol.to_string()),
                scheme: Some(scheme.to_string()),
                authority: Some(authority.to_string()),
                path: Some(path.to_string()),
                status: None,
            },
            headers,
        };
        self.connect_with(section).await
    }

    async fn connect_with(&self, section: FieldSection) -> H3Result<ConnectStream> {
        self.core.check_open()?;
        let mut stream = self.core.open_bidi().await?;
        let control = stream.control();
        let mut writer = stream.take_writer()?;
        let reader = stream.take_reader()?;
        writer.write_headers(self.core.codec().as_ref(), &section).await?;

        let mut message = MessageReader::new(reader, Arc::clone(self.core.codec()), self.core.limits());
        let (status, headers) = match read_final_headers(&mut message).await {
            Ok(head) => head,
            Err(e) => {
                reset_locally(&self.core, control.as_ref(), &e);
                return Err(e);
            }
        };
        if !status.is_success() {
            tracing::debug!("CONNECT on stream {} refused with {}", stream.id, status);
            return Err(H3Error::Http(status));
        }

        Ok(ConnectStream {
            stream_id: stream.id,
            status,
            headers,
            reader: message.into_inner(),
            writer,
            control,
        })
    }

    /// Close the connection.
    pub fn close(&self) {
        tracing::info!("Closing HTTP/3 client connection");
        self.core.close();
    }
}

impl fmt::Debug for H3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H3Client")
            .field("config", &self.config)
            .field("core", &self.core)
            .finish()
    }
}

/// Report a failed response stream to the peer, or close the connection
/// when the failure is connection-level.
fn reset_locally(core: &ConnectionCore, control: &dyn StreamControl, error: &H3Error) {
    if error.should_close_connection() {
        core.close_with_error(error);
        return;
    }
    if error.is_local() {
        return;
    }
    control.abort_reading(error.error_code());
    control.reset_stream(error.error_code());
}

/// Read response HEADERS, skipping informational responses.
async fn read_final_headers(message: &mut MessageReader) -> H3Result<(StatusCode, Headers)> {
    loop {
        let fields = message.read_headers().await?;
        let (status, headers) = parse_response_head(fields)?;
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!("Skipping informational response {}", status);
            message.await_final_headers();
            continue;
        }
        return Ok((status, headers));
    }
}

fn parse_response_head(fields: Vec<HeaderField>) -> H3Result<(StatusCode, Headers)> {
    let section = FieldSection::from_fields(fields)
        .map_err(|reason| ProtocolError::MalformedResponse(reason.to_string()))?;
    let status = section
        .pseudo
        .status
        .as_deref()
        .ok_or_else(|| ProtocolError::MalformedResponse("missing :status".into()))?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProtocolError::MalformedResponse(format!("invalid :status {status:?}")))?;
    Ok((status, section.headers))
}

fn parse_trailers(fields: Vec<HeaderField>) -> H3Result<Headers> {
    if fields.iter().any(HeaderField::is_pseudo) {
        return Err(ProtocolError::MalformedResponse("pseudo-header in trailers".into()).into());
    }
    Ok(fields.into_iter().map(|f| (f.name, f.value)).collect())
}

/// A response whose body is pulled incrementally.
pub struct ResponseStream {
    stream_id: u64,
    status: StatusCode,
    headers: Headers,
    trailers: Option<Headers>,
    message: MessageReader,
    core: Arc<ConnectionCore>,
    control: Arc<dyn StreamControl>,
    chunk_size: usize,
    pending: Bytes,
    finished: bool,
}

impl ResponseStream {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers; trailers are appended once they have been read.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    /// Whether the body has been read to the end.
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    /// Make sure `pending` holds body bytes. Returns false at the end.
    async fn fill(&mut self) -> H3Result<bool> {
        while self.pending.is_empty() {
            if self.finished {
                return Ok(false);
            }
            if let Err(e) = self.advance().await {
                self.finished = true;
                reset_locally(&self.core, self.control.as_ref(), &e);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Consume the next message part.
    async fn advance(&mut self) -> H3Result<()> {
        match self.message.next_part().await? {
            Some(MessagePart::Data(data)) => self.pending = data,
            Some(MessagePart::Trailers(fields)) => {
                let trailers = parse_trailers(fields)?;
                self.headers.extend(trailers.clone());
                self.trailers = Some(trailers);
            }
            Some(MessagePart::Headers(_)) => {
                return Err(ProtocolError::FrameUnexpected { frame_type: 0x01 }.into());
            }
            None => self.finished = true,
        }
        Ok(())
    }

    /// Next batch of the body: DATA payloads coalesced up to the configured
    /// chunk size. Only the last batch may be shorter.
    pub async fn next_chunk(&mut self) -> H3Result<Option<Bytes>> {
        if !self.fill().await? {
            return Ok(None);
        }
        if self.pending.len() >= self.chunk_size {
            return Ok(Some(self.pending.split_to(self.chunk_size)));
        }
        let mut batch = BytesMut::with_capacity(self.chunk_size);
        while batch.len() < self.chunk_size && self.fill().await? {
            let n = (self.chunk_size - batch.len()).min(self.pending.len());
            batch.extend_from_slice(&self.pending.split_to(n));
        }
        Ok(Some(batch.freeze()))
    }

    /// Up to `n` chunks; fewer only at the end of the body.
    pub async fn next_batches(&mut self, n: usize) -> H3Result<Vec<Bytes>> {
        let mut batches = Vec::with_capacity(n);
        while batches.len() < n {
            match self.next_chunk().await? {
                Some(chunk) => batches.push(chunk),
                None => break,
            }
        }
        Ok(batches)
    }

    /// Copy body bytes into `buf`. Returns 0 at the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> H3Result<usize> {
        if buf.is_empty() || !self.fill().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    /// Read the rest of the body into a complete response.
    pub async fn collect(mut self) -> H3Result<H3Response> {
        let mut body = Vec::new();
        while self.fill().await? {
            body.extend_from_slice(&std::mem::take(&mut self.pending));
        }
        Ok(H3Response {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
            body: if body.is_empty() {
                Body::Empty
            } else {
                Body::Bytes(Bytes::from(body))
            },
            trailers: self.trailers.take(),
        })
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.finished {
            self.control.abort_reading(codes::H3_REQUEST_CANCELLED);
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("stream_id", &self.stream_id)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish()
    }
}

/// An established CONNECT stream, used as a raw byte tunnel.
pub struct ConnectStream {
    stream_id: u64,
    status: StatusCode,
    headers: Headers,
    reader: StreamReader,
    writer: StreamWriter,
    control: Arc<dyn StreamControl>,
}

impl ConnectStream {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Read up to `max` bytes, `None` at end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> H3Result<Option<Bytes>> {
        self.reader.read_chunk(max).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> H3Result<()> {
        self.writer.write_all(data).await
    }

    /// Close the sending side.
    pub async fn finish(&mut self) -> H3Result<()> {
        self.writer.finish().await
    }

    pub fn abort_reading(&self, error_code: u64) {
        self.control.abort_reading(error_code);
    }

    pub fn reset_stream(&self, error_code: u64) {
        self.control.reset_stream(error_code);
    }

    /// Split into the reader, writer and control handle.
    pub fn into_parts(self) -> (StreamReader, StreamWriter, Arc<dyn StreamControl>) {
        (self.reader, self.writer, self.control)
    }
}

impl fmt::Debug for ConnectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectStream")
            .field("stream_id", &self.stream_id)
            .field("status", &self.status)
            .finish()
    }
}
