//! HTTP/3 server implementation.

use crate::config::ServerConfig;
use crate::connection::{BidiStreamHandler, ConnectionCore, Role};
use crate::error::{codes, H3Error, H3Result, MalformedReason, ProtocolError};
use crate::protocol::headers::{FieldSection, HeaderField, Headers, PseudoHeaders};
use crate::protocol::qpack::{HeaderCodec, StaticQpack};
use crate::protocol::settings::{SettingId, Settings};
use crate::protocol::stream::{HttpStream, MessagePart, MessageReader, StreamReader, StreamWriter};
use crate::protocol::{H3Response, ServerRequest, ServerResponse};
use crate::transport::{QuicConnection, QuicStream, StreamControl};
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::Stream;
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Trait for handling HTTP/3 requests.
///
/// The request body and trailers have been read in full when this runs.
/// Anything the handler leaves unsent goes out when it returns: a missing
/// status becomes 405 and the stream is finished.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request<'a>(
        &'a self,
        request: &'a ServerRequest,
        response: &'a mut ServerResponse,
    ) -> BoxFuture<'a, H3Result<()>>;
}

/// Simple function-based request handler.
pub struct FunctionHandler<F> {
    handler: F,
}

impl<F, Fut> RequestHandler for FunctionHandler<F>
where
    F: Fn(ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = H3Result<H3Response>> + Send + 'static,
{
    fn handle_request<'a>(
        &'a self,
        request: &'a ServerRequest,
        response: &'a mut ServerResponse,
    ) -> BoxFuture<'a, H3Result<()>> {
        Box::pin(async move {
            let reply = (self.handler)(request.clone()).await?;
            response.set_status(i32::from(reply.status.as_u16()))?;
            for field in reply.headers.iter() {
                response.add_header(field.name.clone(), field.value.clone())?;
            }
            let mut body = reply.body;
            while let Some(chunk) = body.next_chunk().await? {
                response.write(chunk).await?;
            }
            match reply.trailers {
                Some(trailers) => response.send_trailers(trailers).await,
                None => response.finish().await,
            }
        })
    }
}

/// Helper function to create a simple request handler from a closure.
pub fn handler<F, Fut>(f: F) -> FunctionHandler<F>
where
    F: Fn(ServerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = H3Result<H3Response>> + Send + 'static,
{
    FunctionHandler { handler: f }
}

/// Serves Extended CONNECT requests for one `:protocol`.
pub trait Extension: Send + Sync + 'static {
    fn handle_connect(
        &self,
        request: ServerRequest,
        responder: ConnectResponder,
    ) -> BoxFuture<'_, H3Result<()>>;
}

/// Creates the [`Extension`] for a protocol on first use.
pub trait ExtensionFactory: Send + Sync + 'static {
    fn create(&self, core: &Arc<ConnectionCore>) -> H3Result<Arc<dyn Extension>>;
}

impl<F> ExtensionFactory for F
where
    F: Fn(&Arc<ConnectionCore>) -> H3Result<Arc<dyn Extension>> + Send + Sync + 'static,
{
    fn create(&self, core: &Arc<ConnectionCore>) -> H3Result<Arc<dyn Extension>> {
        self(core)
    }
}

/// Protocol name to extension, instantiated lazily.
#[derive(Default)]
struct ExtensionCache {
    factories: Mutex<HashMap<String, Arc<dyn ExtensionFactory>>>,
    instances: Mutex<HashMap<String, Arc<dyn Extension>>>,
}

impl ExtensionCache {
    fn register(&self, protocol: String, factory: Arc<dyn ExtensionFactory>) {
        self.factories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol, factory);
    }

    /// Instances are created under the lock so concurrent CONNECTs share one.
    fn resolve(&self, protocol: &str, core: &Arc<ConnectionCore>) -> H3Result<Option<Arc<dyn Extension>>> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(extension) = instances.get(protocol) {
            return Ok(Some(Arc::clone(extension)));
        }
        let factory = self
            .factories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned();
        let Some(factory) = factory else {
            return Ok(None);
        };
        tracing::debug!("Instantiating extension for protocol {}", protocol);
        let extension = factory.create(core)?;
        instances.insert(protocol.to_string(), Arc::clone(&extension));
        Ok(Some(extension))
    }
}

/// Lets an [`Extension`] answer an Extended CONNECT and take over its stream.
pub struct ConnectResponder {
    stream_id: u64,
    reader: StreamReader,
    writer: StreamWriter,
    control: Arc<dyn StreamControl>,
    codec: Arc<dyn HeaderCodec>,
    last_status: Option<StatusCode>,
}

impl ConnectResponder {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Send a response HEADERS frame.
    pub async fn respond(&mut self, status: StatusCode) -> H3Result<()> {
        self.respond_with_headers(status, Headers::new()).await
    }

    pub async fn respond_with_headers(&mut self, status: StatusCode, headers: Headers) -> H3Result<()> {
        let section = FieldSection {
            pseudo: PseudoHeaders {
                status: Some(status.as_str().to_string()),
                ..PseudoHeaders::default()
            },
            headers,
        };
        self.writer.write_headers(self.codec.as_ref(), &section).await?;
        self.last_status = Some(status);
        Ok(())
    }

    /// Reject the request and close the stream.
    pub async fn reject(mut self, status: StatusCode) -> H3Result<()> {
        self.respond(status).await?;
        self.writer.finish().await
    }

    pub fn control(&self) -> Arc<dyn StreamControl> {
        Arc::clone(&self.control)
    }

    /// Take the stream for the accepted protocol. A 2xx must have been sent.
    pub fn accept(self) -> H3Result<HttpStream> {
        match self.last_status {
            Some(status) if status.is_success() => Ok(HttpStream::from_parts(
                self.stream_id,
                Some(self.reader),
                Some(self.writer),
                self.control,
            )),
            Some(status) => Err(H3Error::illegal_state(format!(
                "cannot accept CONNECT after status {status}"
            ))),
            None => Err(H3Error::illegal_state("cannot accept CONNECT before responding")),
        }
    }
}

impl fmt::Debug for ConnectResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectResponder")
            .field("stream_id", &self.stream_id)
            .field("last_status", &self.last_status)
            .finish()
    }
}

/// Routes request streams to the request handler or an extension.
struct Dispatcher {
    core: Arc<ConnectionCore>,
    handler: Arc<dyn RequestHandler>,
    extensions: ExtensionCache,
    last_request: Mutex<Option<u64>>,
}

impl BidiStreamHandler for Dispatcher {
    fn handle_stream(&self, _signal: u64, stream: HttpStream) -> BoxFuture<'_, H3Result<()>> {
        Box::pin(self.handle_request_stream(stream))
    }
}

impl Dispatcher {
    async fn handle_request_stream(&self, mut stream: HttpStream) -> H3Result<()> {
        let id = stream.id;
        let control = stream.control();
        let reader = stream.take_reader()?;
        let writer = stream.take_writer()?;
        {
            let mut last = self.last_request.lock().unwrap_or_else(PoisonError::into_inner);
            *last = Some(last.map_or(id, |prev| prev.max(id)));
        }

        let codec = Arc::clone(self.core.codec());
        let mut message = MessageReader::new(reader, Arc::clone(&codec), self.core.limits());
        let fields = message.read_headers().await?;
        let section = FieldSection::from_fields(fields).map_err(ProtocolError::MalformedRequest)?;
        section
            .validate_request()
            .map_err(ProtocolError::MalformedRequest)?;
        let mut request = ServerRequest::from_section(id, section)?;
        tracing::debug!(
            "Request on stream {}: {} {}",
            id,
            request.method,
            request.path.as_deref().unwrap_or("")
        );

        if request.method == Method::CONNECT {
            let Some(protocol) = request.protocol.clone() else {
                tracing::debug!("Plain CONNECT on stream {} not supported", id);
                return respond_status(writer, codec, StatusCode::NOT_IMPLEMENTED).await;
            };
            let Some(extension) = self.extensions.resolve(&protocol, &self.core)? else {
                tracing::debug!("No extension for protocol {} on stream {}", protocol, id);
                return respond_status(writer, codec, StatusCode::NOT_IMPLEMENTED).await;
            };
            let responder = ConnectResponder {
                stream_id: id,
                reader: message.into_inner(),
                writer,
                control,
                codec,
                last_status: None,
            };
            return extension.handle_connect(request, responder).await;
        }

        let mut body = BytesMut::new();
        while let Some(part) = message.next_part().await? {
            match part {
                MessagePart::Data(data) => body.extend_from_slice(&data),
                MessagePart::Trailers(fields) => request.trailers = Some(parse_trailers(fields)?),
                MessagePart::Headers(_) => {
                    return Err(ProtocolError::FrameUnexpected { frame_type: 0x01 }.into())
                }
            }
        }
        request.body = body.freeze();

        let mut response = ServerResponse::new(writer, codec);
        match self.handler.handle_request(&request, &mut response).await {
            Ok(()) => response.finish().await,
            Err(e) => {
                tracing::warn!("Handler for stream {} failed: {}", id, e);
                control.abort_reading(codes::H3_INTERNAL_ERROR);
                if response.headers_sent() {
                    control.reset_stream(codes::H3_INTERNAL_ERROR);
                    return Ok(());
                }
                let sent = match response.set_status(500) {
                    Ok(()) => response.finish().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!("Could not send 500 on stream {}: {}", id, e);
                }
                Ok(())
            }
        }
    }
}

fn parse_trailers(fields: Vec<HeaderField>) -> H3Result<Headers> {
    if fields.iter().any(HeaderField::is_pseudo) {
        return Err(ProtocolError::MalformedRequest(MalformedReason::PseudoHeaderInTrailers).into());
    }
    Ok(fields.into_iter().map(|f| (f.name, f.value)).collect())
}

async fn respond_status(
    writer: StreamWriter,
    codec: Arc<dyn HeaderCodec>,
    status: StatusCode,
) -> H3Result<()> {
    let mut response = ServerResponse::new(writer, codec);
    response.set_status(i32::from(status.as_u16()))?;
    response.finish().await
}

/// HTTP/3 server for handling incoming requests on one QUIC connection.
#[derive(Clone)]
pub struct H3Server {
    /// Server configuration
    config: ServerConfig,
    core: Arc<ConnectionCore>,
    dispatcher: Arc<Dispatcher>,
}

impl H3Server {
    /// Create a server over `transport` answering requests with `handler`.
    pub fn new<H>(transport: Arc<dyn QuicConnection>, config: ServerConfig, handler: H) -> H3Result<Self>
    where
        H: RequestHandler,
    {
        Self::with_codec(transport, config, Arc::new(StaticQpack), Arc::new(handler))
    }

    pub fn with_codec(
        transport: Arc<dyn QuicConnection>,
        config: ServerConfig,
        codec: Arc<dyn HeaderCodec>,
        handler: Arc<dyn RequestHandler>,
    ) -> H3Result<Self> {
        config.validate()?;
        let mut settings = Settings::new();
        if config.qpack_max_table_capacity > 0 {
            settings.insert(SettingId::QpackMaxTableCapacity, config.qpack_max_table_capacity);
        }
        if config.qpack_blocked_streams > 0 {
            settings.insert(SettingId::QpackBlockedStreams, config.qpack_blocked_streams);
        }
        if config.enable_connect_protocol {
            settings.insert(SettingId::EnableConnectProtocol, 1);
        }
        if config.max_webtransport_sessions > 0 {
            settings.insert(SettingId::H3Datagram, 1);
            settings.insert(SettingId::WebTransportMaxSessions, config.max_webtransport_sessions);
        }

        let core = ConnectionCore::new(Role::Server, transport, codec, config.limits, settings);
        if config.send_grease {
            core.add_grease_setting()?;
        }
        let dispatcher = Arc::new(Dispatcher {
            core: Arc::clone(&core),
            handler,
            extensions: ExtensionCache::default(),
            last_request: Mutex::new(None),
        });
        Ok(Self {
            config,
            core,
            dispatcher,
        })
    }

    /// Open the control stream and send SETTINGS.
    pub async fn start(&self) -> H3Result<()> {
        tracing::info!("Starting HTTP/3 server");
        self.core.start().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared connection state.
    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// Serve Extended CONNECT requests for `protocol` with extensions from `factory`.
    pub fn register_extension(&self, protocol: impl Into<String>, factory: Arc<dyn ExtensionFactory>) {
        let protocol = protocol.into();
        tracing::debug!("Registering extension for protocol {}", protocol);
        self.dispatcher.extensions.register(protocol, factory);
    }

    /// Hand a peer-initiated stream to the server.
    pub fn accept_stream(&self, stream: QuicStream) {
        let dispatcher: Arc<dyn BidiStreamHandler> = Arc::clone(&self.dispatcher) as _;
        self.core.accept_stream(stream, Some(dispatcher));
    }

    /// Accept peer-initiated streams until `incoming` ends.
    pub async fn serve<S>(&self, incoming: S)
    where
        S: Stream<Item = QuicStream> + Unpin,
    {
        let dispatcher: Arc<dyn BidiStreamHandler> = Arc::clone(&self.dispatcher) as _;
        self.core.serve(incoming, Some(dispatcher)).await;
    }

    /// Send GOAWAY so the client stops issuing new requests.
    pub async fn shutdown(&self) -> H3Result<()> {
        tracing::info!("Shutting down HTTP/3 server");
        let last = *self
            .dispatcher
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.core.send_goaway(last.map_or(0, |id| id + 4)).await
    }

    /// Close the connection.
    pub fn close(&self) {
        self.core.close();
    }
}

impl fmt::Debug for H3Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H3Server")
            .field("config", &self.config)
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::H3Client;
    use crate::config::ClientConfig;
    use crate::connection::tests::close_reason;
    use crate::error::ConnectionError;
    use crate::protocol::frame::H3Frame;
    use crate::protocol::stream::tests::headers_frame;
    use crate::protocol::{Body, H3Request};
    use crate::transport::memory::{pair, MemoryConnection, MemoryEndpoint};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Pair {
        client: H3Client,
        server: H3Server,
        client_conn: Arc<MemoryConnection>,
        server_conn: Arc<MemoryConnection>,
    }

    async fn connected<H: RequestHandler>(config: ServerConfig, handler: H) -> Pair {
        let (client_ep, server_ep) = pair();
        let MemoryEndpoint { connection: client_conn, incoming: client_incoming } = client_ep;
        let MemoryEndpoint { connection: server_conn, incoming: server_incoming } = server_ep;

        let client = H3Client::new(client_conn.clone(), ClientConfig::default()).unwrap();
        let server = H3Server::new(server_conn.clone(), config, handler).unwrap();

        let c = client.clone();
        tokio::spawn(async move { c.serve(client_incoming).await });
        let s = server.clone();
        tokio::spawn(async move { s.serve(server_incoming).await });
        client.start().await.unwrap();
        server.start().await.unwrap();

        Pair {
            client,
            server,
            client_conn,
            server_conn,
        }
    }

    async fn eventually<T>(f: impl Fn() -> Option<T>) -> Option<T> {
        for _ in 0..200 {
            if let Some(value) = f() {
                return Some(value);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    /// Mirrors the request headers back as JSON.
    struct HeadersMirror;

    impl RequestHandler for HeadersMirror {
        fn handle_request<'a>(
            &'a self,
            request: &'a ServerRequest,
            response: &'a mut ServerResponse,
        ) -> BoxFuture<'a, H3Result<()>> {
            Box::pin(async move {
                if request.path_only() != "/headers" {
                    response.set_status(404)?;
                    return Ok(());
                }
                let headers: serde_json::Map<String, serde_json::Value> = request
                    .headers
                    .to_multimap()
                    .into_iter()
                    .map(|(name, values)| (name, serde_json::json!(values)))
                    .collect();
                let body = serde_json::json!({ "headers": headers }).to_string();
                response.set_status(200)?;
                response.add_header("content-type", "application/json")?;
                response.write(body).await
            })
        }
    }

    struct Silent;

    impl RequestHandler for Silent {
        fn handle_request<'a>(
            &'a self,
            _request: &'a ServerRequest,
            _response: &'a mut ServerResponse,
        ) -> BoxFuture<'a, H3Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Failing;

    impl RequestHandler for Failing {
        fn handle_request<'a>(
            &'a self,
            _request: &'a ServerRequest,
            _response: &'a mut ServerResponse,
        ) -> BoxFuture<'a, H3Result<()>> {
            Box::pin(async { Err(H3Error::internal("boom")) })
        }
    }

    #[derive(Default)]
    struct Recording {
        called: AtomicBool,
    }

    impl RequestHandler for Arc<Recording> {
        fn handle_request<'a>(
            &'a self,
            request: &'a ServerRequest,
            response: &'a mut ServerResponse,
        ) -> BoxFuture<'a, H3Result<()>> {
            Box::pin(async move {
                self.called.store(true, Ordering::SeqCst);
                response.set_status(200)?;
                response.write(request.body.clone()).await?;
                if let Some(trailers) = &request.trailers {
                    response.send_trailers(trailers.clone()).await?;
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_header_mirror() {
        let pair = connected(ServerConfig::default(), HeadersMirror).await;
        let request = H3Request::get("https://localhost:4433/headers")
            .header("User-Agent", "JUnit-Test")
            .build()
            .unwrap();
        let response = pair.client.send_request(request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type(), Some("application/json"));
        let body = response.body.to_bytes().await.unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"headers":{"User-Agent":["JUnit-Test"]}}"#
        );
    }

    #[tokio::test]
    async fn test_function_handler() {
        let handler = handler(|request: ServerRequest| async move {
            Ok::<_, H3Error>(H3Response::ok()
                .with_header("x-path", request.path_only().to_string())
                .with_body("Hello, World!"))
        });
        let pair = connected(ServerConfig::default(), handler).await;

        let request = H3Request::get("https://example.com/hello").build().unwrap();
        let response = pair.client.send_request(request).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.headers.get("x-path"), Some("/hello"));
        assert_eq!(
            response.body.to_bytes().await.unwrap(),
            Bytes::from_static(b"Hello, World!")
        );
    }

    #[tokio::test]
    async fn test_unset_status_defaults_to_405() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let request = H3Request::get("https://example.com/").build().unwrap();
        let response = pair.client.send_request(request).await.unwrap();
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_handler_failure_sends_500() {
        let pair = connected(ServerConfig::default(), Failing).await;
        let request = H3Request::get("https://example.com/").build().unwrap();
        let response = pair.client.send_request(request).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        let control = pair.server_conn.stream_control(0).unwrap();
        assert_eq!(control.abort_code(), Some(codes::H3_INTERNAL_ERROR));
        assert!(pair.server_conn.close_reason().is_none());
    }

    #[tokio::test]
    async fn test_body_and_trailers_reach_handler() {
        let recording = Arc::new(Recording::default());
        let pair = connected(ServerConfig::default(), Arc::clone(&recording)).await;

        let mut request = H3Request::post("https://example.com/echo")
            .body(Body::from_chunks(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]))
            .build()
            .unwrap();
        request.headers.append("x-request", "1");
        let response = pair.client.send_request(request).await.unwrap();
        assert!(recording.called.load(Ordering::SeqCst));
        assert_eq!(response.body.to_bytes().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_malformed_request_aborted() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let mut stream = pair.client.core().open_bidi().await.unwrap();
        let mut writer = stream.take_writer().unwrap();
        writer
            .write_all(&headers_frame(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "example.com"),
            ]))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let code = eventually(|| pair.server_conn.stream_control(0).and_then(|c| c.reset_code())).await;
        assert_eq!(code, Some(codes::H3_MESSAGE_ERROR));
        assert!(pair.server_conn.close_reason().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_field_section_closes_connection() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let mut stream = pair.client.core().open_bidi().await.unwrap();
        let mut writer = stream.take_writer().unwrap();
        // Indexed field line pointing into the dynamic table.
        let frame = H3Frame::Headers(Bytes::from_static(&[0x00, 0x00, 0x80]));
        writer.write_frame(&frame).await.unwrap();
        writer.finish().await.unwrap();

        let (code, _) = close_reason(&pair.server_conn).await.unwrap();
        assert_eq!(code, codes::QPACK_DECOMPRESSION_FAILED);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_handler() {
        let recording = Arc::new(Recording::default());
        let config = ServerConfig::builder().max_data_size(10).build();
        let pair = connected(config, Arc::clone(&recording)).await;

        let request = H3Request::post("https://example.com/upload")
            .body(vec![0u8; 12])
            .build()
            .unwrap();
        assert!(pair.client.send_request(request).await.is_err());

        let code = eventually(|| pair.server_conn.stream_control(0).and_then(|c| c.reset_code())).await;
        assert_eq!(code, Some(codes::H3_EXCESSIVE_LOAD));
        assert!(!recording.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_oversized_headers_rejected() {
        let recording = Arc::new(Recording::default());
        let config = ServerConfig::builder().max_header_size(16).build();
        let pair = connected(config, Arc::clone(&recording)).await;

        let request = H3Request::get("https://example.com/")
            .header("x-padding", "a".repeat(64))
            .build()
            .unwrap();
        assert!(pair.client.send_request(request).await.is_err());

        let code = eventually(|| pair.server_conn.stream_control(0).and_then(|c| c.reset_code())).await;
        assert_eq!(code, Some(codes::H3_EXCESSIVE_LOAD));
        assert!(!recording.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_plain_connect_not_implemented() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let err = pair.client.send_connect("proxy.example:443").await.unwrap_err();
        assert!(matches!(err, H3Error::Http(s) if s == StatusCode::NOT_IMPLEMENTED));
    }

    #[tokio::test]
    async fn test_unknown_protocol_not_implemented() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let err = pair
            .client
            .send_extended_connect("example.com", "chat", "https", "/", Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::Http(s) if s == StatusCode::NOT_IMPLEMENTED));
    }

    /// Accepts with 200 and echoes the tunnel back.
    struct Echo;

    impl Extension for Echo {
        fn handle_connect(
            &self,
            request: ServerRequest,
            mut responder: ConnectResponder,
        ) -> BoxFuture<'_, H3Result<()>> {
            Box::pin(async move {
                assert!(request.is_extended_connect());
                responder.respond(StatusCode::OK).await?;
                let mut stream = responder.accept()?;
                let mut reader = stream.take_reader()?;
                let mut writer = stream.take_writer()?;
                while let Some(chunk) = reader.read_chunk(1024).await? {
                    writer.write_all(&chunk).await?;
                }
                writer.finish().await
            })
        }
    }

    #[tokio::test]
    async fn test_extended_connect_tunnel() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        pair.server.register_extension(
            "echo",
            Arc::new(move |_core: &Arc<ConnectionCore>| -> H3Result<Arc<dyn Extension>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Echo))
            }),
        );

        for _ in 0..2 {
            let mut tunnel = pair
                .client
                .send_extended_connect("example.com", "echo", "https", "/echo", Headers::new())
                .await
                .unwrap();
            assert_eq!(tunnel.status(), StatusCode::OK);
            tunnel.write_all(b"ping").await.unwrap();
            tunnel.finish().await.unwrap();
            let mut echoed = Vec::new();
            while let Some(chunk) = tunnel.read_chunk(16).await.unwrap() {
                echoed.extend_from_slice(&chunk);
            }
            assert_eq!(echoed, b"ping");
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    struct Refusing {
        accept_failed: Arc<AtomicBool>,
    }

    impl Extension for Refusing {
        fn handle_connect(
            &self,
            _request: ServerRequest,
            mut responder: ConnectResponder,
        ) -> BoxFuture<'_, H3Result<()>> {
            Box::pin(async move {
                responder.respond(StatusCode::FORBIDDEN).await?;
                let result = responder.accept();
                self.accept_failed
                    .store(matches!(result, Err(H3Error::IllegalState(_))), Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_accept_requires_success_status() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let accept_failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&accept_failed);
        pair.server.register_extension(
            "guarded",
            Arc::new(move |_core: &Arc<ConnectionCore>| -> H3Result<Arc<dyn Extension>> {
                Ok(Arc::new(Refusing {
                    accept_failed: Arc::clone(&flag),
                }))
            }),
        );

        let err = pair
            .client
            .send_extended_connect("example.com", "guarded", "https", "/", Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::Http(s) if s == StatusCode::FORBIDDEN));
        assert!(eventually(|| accept_failed.load(Ordering::SeqCst).then_some(())).await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_sends_goaway() {
        let pair = connected(ServerConfig::default(), Silent).await;
        let request = H3Request::get("https://example.com/").build().unwrap();
        pair.client.send_request(request).await.unwrap();

        pair.server.shutdown().await.unwrap();
        let goaway = eventually(|| pair.client.core().peer_goaway()).await;
        assert_eq!(goaway, Some(4));

        let request = H3Request::get("https://example.com/").build().unwrap();
        let err = pair.client.send_request(request).await.unwrap_err();
        assert!(matches!(err, H3Error::Connection(ConnectionError::GoingAway(4))));
        assert!(pair.client_conn.close_reason().is_none());
    }
}
