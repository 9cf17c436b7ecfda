//! A single WebTransport session.

use super::registry::SessionRegistry;
use crate::capsule::{Capsule, CapsuleReader, CapsuleStream, CapsuleWriter, MAX_CLOSE_MESSAGE_LEN};
use crate::connection::{stream_type, ConnectionCore, WEBTRANSPORT_BIDI_SIGNAL};
use crate::error::{codes, H3Error, H3Result, ParseError, SessionError, StreamError};
use crate::protocol::stream::HttpStream;
use crate::transport::StreamControl;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A stream belonging to a session. Unidirectional streams carry one half.
pub type WebTransportStream = HttpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Open,
    Closing,
    Closed,
}

type StreamCallback = Arc<dyn Fn(WebTransportStream) + Send + Sync>;
type DrainListener = Arc<dyn Fn() + Send + Sync>;
type TerminatedListener = Box<dyn FnOnce(u32, &str) + Send>;

struct Shared {
    state: SessionState,
    capsules: Option<CapsuleReader>,
    reader_task: Option<JoinHandle<()>>,
    sending: Vec<Arc<dyn StreamControl>>,
    receiving: Vec<Arc<dyn StreamControl>>,
    uni_handler: Option<StreamCallback>,
    bidi_handler: Option<StreamCallback>,
    draining: bool,
    drain_listeners: Vec<DrainListener>,
    terminated_listeners: Vec<TerminatedListener>,
}

struct SessionInner {
    id: u64,
    core: Arc<ConnectionCore>,
    registry: Weak<SessionRegistry>,
    connect_control: Arc<dyn StreamControl>,
    writer: tokio::sync::Mutex<Option<CapsuleWriter>>,
    shared: Mutex<Shared>,
    terminated: watch::Sender<Option<(u32, String)>>,
}

/// A WebTransport session, identified by the id of its CONNECT stream.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Refuse a stream that cannot be delivered to a session.
pub(crate) fn refuse_stream(stream: &HttpStream, error_code: u64) {
    if stream.reader.is_some() {
        stream.abort_reading(error_code);
    }
    if stream.writer.is_some() {
        stream.reset_stream(error_code);
    }
}

impl Session {
    pub(crate) fn new(
        id: u64,
        core: Arc<ConnectionCore>,
        registry: &Arc<SessionRegistry>,
        capsules: CapsuleStream,
        connect_control: Arc<dyn StreamControl>,
    ) -> Self {
        let (reader, writer) = capsules.split();
        let (terminated, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                id,
                core,
                registry: Arc::downgrade(registry),
                connect_control,
                writer: tokio::sync::Mutex::new(Some(writer)),
                shared: Mutex::new(Shared {
                    state: SessionState::Created,
                    capsules: Some(reader),
                    reader_task: None,
                    sending: Vec::new(),
                    receiving: Vec::new(),
                    uni_handler: None,
                    bidi_handler: None,
                    draining: false,
                    drain_listeners: Vec::new(),
                    terminated_listeners: Vec::new(),
                }),
                terminated,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Whether the peer asked for the session to wind down.
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Receive peer-initiated unidirectional streams.
    pub fn set_unidirectional_stream_handler<F>(&self, handler: F)
    where
        F: Fn(WebTransportStream) + Send + Sync + 'static,
    {
        self.inner.lock().uni_handler = Some(Arc::new(handler));
    }

    /// Receive peer-initiated bidirectional streams.
    pub fn set_bidirectional_stream_handler<F>(&self, handler: F)
    where
        F: Fn(WebTransportStream) + Send + Sync + 'static,
    {
        self.inner.lock().bidi_handler = Some(Arc::new(handler));
    }

    pub fn on_drain<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: DrainListener = Arc::new(listener);
        let draining = {
            let mut shared = self.inner.lock();
            shared.drain_listeners.push(Arc::clone(&listener));
            shared.draining
        };
        if draining {
            listener();
        }
    }

    /// Called once with the close code and message when the session ends.
    pub fn on_terminated<F>(&self, listener: F)
    where
        F: FnOnce(u32, &str) + Send + 'static,
    {
        let mut shared = self.inner.lock();
        if shared.state == SessionState::Closed {
            drop(shared);
            let (code, message) = self.inner.terminated.borrow().clone().unwrap_or_default();
            listener(code, &message);
            return;
        }
        shared.terminated_listeners.push(Box::new(listener));
    }

    /// Wait until the session has ended. Yields the close code and message.
    pub async fn closed(&self) -> (u32, String) {
        let mut rx = self.inner.terminated.subscribe();
        loop {
            if let Some(info) = rx.borrow_and_update().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return (0, String::new());
            }
        }
    }

    /// Start the session: register it, read capsules, deliver buffered streams.
    pub fn open(&self) -> H3Result<()> {
        let capsules = {
            let mut shared = self.inner.lock();
            if shared.state != SessionState::Created {
                return Err(H3Error::illegal_state(format!(
                    "session {} cannot be opened in state {:?}",
                    self.inner.id, shared.state
                )));
            }
            shared.state = SessionState::Open;
            shared.capsules.take()
        };

        let buffered = match self.inner.registry.upgrade() {
            Some(registry) => match registry.register(self) {
                Ok(buffered) => buffered,
                Err(e) => {
                    self.inner.lock().state = SessionState::Closed;
                    return Err(e);
                }
            },
            None => Vec::new(),
        };
        tracing::debug!("WebTransport session {} open", self.inner.id);

        if let Some(capsules) = capsules {
            let inner = Arc::clone(&self.inner);
            let task = tokio::spawn(async move { inner.read_capsules(capsules).await });
            self.inner.lock().reader_task = Some(task);
        }
        for (stream, bidirectional) in buffered {
            self.route_incoming(stream, bidirectional);
        }
        Ok(())
    }

    /// Close the session with an application error code and message.
    ///
    /// Only acts while the session is open; later calls do nothing.
    pub async fn close(&self, code: u32, message: &str) -> H3Result<()> {
        if message.len() > MAX_CLOSE_MESSAGE_LEN {
            return Err(ParseError::CapsuleTooLarge(message.len()).into());
        }
        if !self.inner.begin_closing() {
            return Ok(());
        }
        tracing::debug!("Closing WebTransport session {}: {} {}", self.inner.id, code, message);

        let capsule = Capsule::CloseSession {
            code,
            message: message.to_string(),
        };
        let sent = match self.inner.writer.lock().await.as_mut() {
            Some(writer) => writer.send_and_close(&capsule).await,
            None => Ok(()),
        };
        self.inner.terminate(code, message);
        sent
    }

    /// Ask the peer to wind the session down.
    pub async fn drain(&self) -> H3Result<()> {
        self.check_open()?;
        match self.inner.writer.lock().await.as_mut() {
            Some(writer) => writer.send(&Capsule::Drain).await,
            None => Ok(()),
        }
    }

    fn check_open(&self) -> H3Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::NotOpen(self.inner.id).into())
        }
    }

    /// Open a unidirectional stream in this session.
    pub async fn create_unidirectional_stream(&self) -> H3Result<WebTransportStream> {
        self.check_open()?;
        let mut stream = self.inner.core.open_uni().await?;
        let writer = stream
            .writer
            .as_mut()
            .ok_or(StreamError::MissingHalf("send"))?;
        writer
            .write_varints(&[stream_type::WEBTRANSPORT, self.inner.id])
            .await?;
        self.track(&stream)?;
        Ok(stream)
    }

    /// Open a bidirectional stream in this session.
    pub async fn create_bidirectional_stream(&self) -> H3Result<WebTransportStream> {
        self.check_open()?;
        let mut stream = self.inner.core.open_bidi().await?;
        let writer = stream
            .writer
            .as_mut()
            .ok_or(StreamError::MissingHalf("send"))?;
        writer
            .write_varints(&[WEBTRANSPORT_BIDI_SIGNAL, self.inner.id])
            .await?;
        self.track(&stream)?;
        Ok(stream)
    }

    /// Remember a stream so that closing the session cancels it.
    fn track(&self, stream: &HttpStream) -> H3Result<()> {
        let mut shared = self.inner.lock();
        if shared.state != SessionState::Open {
            drop(shared);
            refuse_stream(stream, codes::WT_SESSION_GONE);
            return Err(SessionError::NotOpen(self.inner.id).into());
        }
        if stream.reader.is_some() {
            shared.receiving.push(stream.control());
        }
        if stream.writer.is_some() {
            shared.sending.push(stream.control());
        }
        Ok(())
    }

    /// Deliver a peer stream whose header named this session.
    pub(crate) fn route_incoming(&self, stream: WebTransportStream, bidirectional: bool) {
        let handler = {
            let shared = self.inner.lock();
            if shared.state != SessionState::Open {
                None
            } else if bidirectional {
                Some(shared.bidi_handler.clone())
            } else {
                Some(shared.uni_handler.clone())
            }
        };
        let Some(handler) = handler else {
            tracing::debug!("Stream {} for ended session {}", stream.id, self.inner.id);
            refuse_stream(&stream, codes::WT_SESSION_GONE);
            return;
        };
        let Some(handler) = handler else {
            tracing::debug!(
                "No handler for stream {} in session {}",
                stream.id,
                self.inner.id
            );
            refuse_stream(&stream, codes::webtransport_to_http3(0));
            return;
        };
        if self.track(&stream).is_ok() {
            handler(stream);
        }
    }
}

impl SessionInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Open to Closing. False if the session was not open.
    fn begin_closing(&self) -> bool {
        let mut shared = self.lock();
        if shared.state != SessionState::Open {
            return false;
        }
        shared.state = SessionState::Closing;
        true
    }

    async fn read_capsules(self: Arc<Self>, mut capsules: CapsuleReader) {
        loop {
            match capsules.receive().await {
                Ok(Some(Capsule::CloseSession { code, message })) => {
                    self.peer_closed(code, &message).await;
                    return;
                }
                Ok(Some(Capsule::Drain)) => self.peer_draining(),
                Ok(Some(Capsule::Generic { capsule_type, .. })) => {
                    tracing::debug!(
                        "Ignoring capsule {:#x} in session {}",
                        capsule_type,
                        self.id
                    );
                }
                Ok(None) => {
                    self.peer_closed(0, "").await;
                    return;
                }
                Err(e) => {
                    tracing::warn!("Capsule stream of session {} failed: {}", self.id, e);
                    if self.begin_closing() {
                        self.connect_control.abort_reading(e.error_code());
                        self.connect_control.reset_stream(e.error_code());
                        self.terminate(0, &e.to_string());
                    }
                    return;
                }
            }
        }
    }

    async fn peer_closed(&self, code: u32, message: &str) {
        if !self.begin_closing() {
            return;
        }
        tracing::debug!("Peer closed WebTransport session {}: {} {}", self.id, code, message);
        if let Some(writer) = self.writer.lock().await.as_mut() {
            if let Err(e) = writer.close().await {
                tracing::debug!("FIN on session {} failed: {}", self.id, e);
            }
        }
        self.terminate(code, message);
    }

    fn peer_draining(&self) {
        let listeners = {
            let mut shared = self.lock();
            shared.draining = true;
            shared.drain_listeners.clone()
        };
        tracing::debug!("WebTransport session {} draining", self.id);
        for listener in listeners {
            listener();
        }
    }

    /// Cancel every tracked stream and notify listeners.
    fn terminate(&self, code: u32, message: &str) {
        let (sending, receiving, listeners, task) = {
            let mut shared = self.lock();
            shared.state = SessionState::Closed;
            shared.uni_handler = None;
            shared.bidi_handler = None;
            shared.drain_listeners.clear();
            (
                std::mem::take(&mut shared.sending),
                std::mem::take(&mut shared.receiving),
                std::mem::take(&mut shared.terminated_listeners),
                shared.reader_task.take(),
            )
        };
        for control in &sending {
            control.reset_stream(codes::WT_SESSION_GONE);
        }
        for control in &receiving {
            control.abort_reading(codes::WT_SESSION_GONE);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
        self.terminated
            .send_replace(Some((code, message.to_string())));
        for listener in listeners {
            listener(code, message);
        }
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
