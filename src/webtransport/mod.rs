//! WebTransport over HTTP/3.
//!
//! A session is an Extended CONNECT stream with `:protocol = webtransport`.
//! The CONNECT stream carries capsules; data travels on separate streams
//! whose header names the session:
//!
//! ```text
//! unidirectional:  0x54 <session id> <payload...>
//! bidirectional:   0x41 <session id> <payload...>
//! ```
//!
//! Both ends register an [`IncomingStreams`] router on the connection so that
//! these streams reach their session, or wait for it in the
//! [`SessionRegistry`] if they arrive first.

mod registry;
mod session;

pub use registry::SessionRegistry;
pub use session::{Session, SessionState, WebTransportStream};

use session::refuse_stream;

use crate::capsule::CapsuleStream;
use crate::client::H3Client;
use crate::config::DEFAULT_MAX_BUFFERED_STREAMS;
use crate::connection::{
    stream_type, BidiStreamHandler, ConnectionCore, Registry, UniStreamHandler,
    WEBTRANSPORT_BIDI_SIGNAL,
};
use crate::error::{codes, CapabilityError, H3Error, H3Result, SessionError, StreamError};
use crate::protocol::headers::Headers;
use crate::protocol::stream::{HttpStream, StreamReader};
use crate::protocol::ServerRequest;
use crate::server::{ConnectResponder, Extension, H3Server};
use crate::transport::StreamControl;
use futures::future::BoxFuture;
use http::StatusCode;
use std::fmt;
use std::sync::Arc;

/// The `:protocol` value of a WebTransport Extended CONNECT.
pub const PROTOCOL: &str = "webtransport";

/// Routes peer WebTransport streams to their sessions.
struct IncomingStreams {
    registry: Arc<SessionRegistry>,
}

impl IncomingStreams {
    fn install(core: &ConnectionCore, registry: &Arc<SessionRegistry>) {
        let router = Arc::new(Self {
            registry: Arc::clone(registry),
        });
        core.register_uni_handler(stream_type::WEBTRANSPORT, Arc::clone(&router) as _);
        core.register_bidi_handler(WEBTRANSPORT_BIDI_SIGNAL, router);
    }
}

impl UniStreamHandler for IncomingStreams {
    fn handle_stream(
        &self,
        _stream_type: u64,
        mut reader: StreamReader,
        control: Arc<dyn StreamControl>,
    ) -> BoxFuture<'_, H3Result<()>> {
        Box::pin(async move {
            let Some(session_id) = reader.read_varint().await? else {
                tracing::debug!("Stream {} ended before its session id", reader.id());
                control.abort_reading(codes::H3_STREAM_CREATION_ERROR);
                return Ok(());
            };
            let stream = HttpStream::from_parts(reader.id(), Some(reader), None, control);
            self.registry.dispatch(session_id, stream, false);
            Ok(())
        })
    }
}

impl BidiStreamHandler for IncomingStreams {
    fn handle_stream(&self, _signal: u64, mut stream: HttpStream) -> BoxFuture<'_, H3Result<()>> {
        Box::pin(async move {
            let reader = stream
                .reader
                .as_mut()
                .ok_or(StreamError::MissingHalf("receive"))?;
            let header = (reader.read_varint().await?, reader.read_varint().await?);
            let (Some(_), Some(session_id)) = header else {
                tracing::debug!("Stream {} ended before its session id", stream.id);
                refuse_stream(&stream, codes::H3_STREAM_CREATION_ERROR);
                return Ok(());
            };
            self.registry.dispatch(session_id, stream, true);
            Ok(())
        })
    }
}

/// Opens WebTransport sessions from an [`H3Client`].
#[derive(Debug, Clone)]
pub struct WebTransportClient {
    client: H3Client,
    registry: Arc<SessionRegistry>,
}

impl WebTransportClient {
    pub fn new(client: H3Client) -> H3Result<Self> {
        if !client.config().enable_webtransport {
            return Err(H3Error::config("WebTransport is disabled in the client configuration"));
        }
        // The limit comes from the server's SETTINGS once they arrive.
        let registry = SessionRegistry::new(0, DEFAULT_MAX_BUFFERED_STREAMS);
        IncomingStreams::install(client.core(), &registry);
        Ok(Self { client, registry })
    }

    pub fn client(&self) -> &H3Client {
        &self.client
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Establish a session at `path` on `authority`.
    pub async fn connect(&self, authority: &str, path: &str) -> H3Result<Session> {
        let core = self.client.core();
        let settings = core
            .wait_for_settings(self.client.config().settings_timeout)
            .await?;
        if !settings.enable_connect_protocol() || settings.webtransport_max_sessions() == 0 {
            return Err(CapabilityError::WebTransportUnsupported.into());
        }
        self.registry
            .set_max_sessions(settings.webtransport_max_sessions());
        if !self.registry.has_capacity() {
            return Err(SessionError::LimitReached(self.registry.max_sessions()).into());
        }

        tracing::debug!("Opening WebTransport session to {}{}", authority, path);
        let stream = self
            .client
            .send_extended_connect(authority, PROTOCOL, "https", path, Headers::new())
            .await?;
        let id = stream.stream_id();
        let (reader, writer, control) = stream.into_parts();
        let capsules = CapsuleStream::new(reader, writer, core.limits().max_frame_size);
        let session = Session::new(id, Arc::clone(core), &self.registry, capsules, control);
        session.open()?;
        Ok(session)
    }
}

/// Accepts WebTransport sessions for one path.
pub trait SessionHandler: Send + Sync + 'static {
    /// Called before the session opens; install stream handlers and
    /// listeners here. An error refuses the session.
    fn accept(&self, session: Session) -> BoxFuture<'_, H3Result<()>>;
}

struct ServerSessions {
    core: Arc<ConnectionCore>,
    registry: Arc<SessionRegistry>,
    paths: Registry<String, Arc<dyn SessionHandler>>,
}

impl Extension for ServerSessions {
    fn handle_connect(
        &self,
        request: ServerRequest,
        responder: ConnectResponder,
    ) -> BoxFuture<'_, H3Result<()>> {
        Box::pin(self.establish(request, responder))
    }
}

impl ServerSessions {
    async fn establish(&self, request: ServerRequest, responder: ConnectResponder) -> H3Result<()> {
        let id = responder.stream_id();
        let path = request.path_only().to_string();
        let Some(handler) = self.paths.get(&path) else {
            tracing::debug!("No WebTransport handler for {}", path);
            return responder.reject(StatusCode::NOT_FOUND).await;
        };
        if let Err(e) = self.registry.try_reserve(id) {
            tracing::debug!("Refusing WebTransport session {}: {}", id, e);
            refuse(responder.control().as_ref());
            return Ok(());
        }

        let control = responder.control();
        match self.open_session(id, handler.as_ref(), responder).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!("WebTransport session {} refused: {}", id, e);
                self.registry.reject(id);
                refuse(control.as_ref());
                Ok(())
            }
        }
    }

    /// Send 200, hand the session to `handler` and open it.
    async fn open_session(
        &self,
        id: u64,
        handler: &dyn SessionHandler,
        mut responder: ConnectResponder,
    ) -> H3Result<()> {
        responder.respond(StatusCode::OK).await?;
        let mut stream = responder.accept()?;
        let capsules = CapsuleStream::new(
            stream.take_reader()?,
            stream.take_writer()?,
            self.core.limits().max_frame_size,
        );
        let session = Session::new(id, Arc::clone(&self.core), &self.registry, capsules, stream.control());
        handler.accept(session.clone()).await?;
        session.open()
    }
}

fn refuse(control: &dyn StreamControl) {
    control.abort_reading(codes::H3_REQUEST_REJECTED);
    control.reset_stream(codes::H3_REQUEST_REJECTED);
}

/// Serves WebTransport sessions on an [`H3Server`].
#[derive(Clone)]
pub struct WebTransportServer {
    server: H3Server,
    sessions: Arc<ServerSessions>,
}

impl WebTransportServer {
    pub fn new(server: &H3Server) -> H3Result<Self> {
        let config = server.config();
        if !config.enable_connect_protocol || config.max_webtransport_sessions == 0 {
            return Err(H3Error::config(
                "WebTransport needs extended CONNECT and a session limit above zero",
            ));
        }
        let registry = SessionRegistry::new(config.max_webtransport_sessions, config.max_buffered_streams);
        IncomingStreams::install(server.core(), &registry);

        let sessions = Arc::new(ServerSessions {
            core: Arc::clone(server.core()),
            registry,
            paths: Registry::new(),
        });
        let extension = Arc::clone(&sessions);
        server.register_extension(
            PROTOCOL,
            Arc::new(move |_core: &Arc<ConnectionCore>| -> H3Result<Arc<dyn Extension>> {
                Ok(Arc::clone(&extension) as Arc<dyn Extension>)
            }),
        );
        Ok(Self {
            server: server.clone(),
            sessions,
        })
    }

    /// Accept sessions at `path` with `handler`, replacing any earlier one.
    pub fn register_path<H>(&self, path: impl Into<String>, handler: H)
    where
        H: SessionHandler,
    {
        self.sessions.paths.register(path.into(), Arc::new(handler));
    }

    pub fn server(&self) -> &H3Server {
        &self.server
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.sessions.registry
    }
}

impl fmt::Debug for WebTransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebTransportServer")
            .field("registry", &self.sessions.registry)
            .field("paths", &self.sessions.paths.len())
            .finish()
    }
}
