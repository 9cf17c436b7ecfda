//! Sessions of one connection, plus streams that arrived before their session.

use super::session::{refuse_stream, Session, WebTransportStream};
use crate::connection::Registry;
use crate::error::{codes, H3Result, SessionError};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct BufferedStream {
    session_id: u64,
    stream: WebTransportStream,
    bidirectional: bool,
}

/// How many terminated session ids are remembered for refusing late streams.
const TERMINATED_MEMORY: usize = 256;

#[derive(Default)]
struct Pending {
    streams: Vec<BufferedStream>,
    /// Slots held by sessions that were accepted but have not opened yet.
    reserved: HashSet<u64>,
    terminated: HashSet<u64>,
    terminated_order: VecDeque<u64>,
}

impl Pending {
    fn terminate(&mut self, session_id: u64) {
        if !self.terminated.insert(session_id) {
            return;
        }
        self.terminated_order.push_back(session_id);
        if self.terminated_order.len() > TERMINATED_MEMORY {
            if let Some(oldest) = self.terminated_order.pop_front() {
                self.terminated.remove(&oldest);
            }
        }
    }

    fn take_streams(&mut self, session_id: u64) -> Vec<BufferedStream> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.streams)
            .into_iter()
            .partition(|b| b.session_id == session_id);
        self.streams = rest;
        mine
    }
}

/// Open sessions by id.
///
/// Registration, lookup for routing and buffering all happen under one lock
/// so that a stream racing its session's registration is never stranded.
pub struct SessionRegistry {
    sessions: Registry<u64, Session>,
    pending: Mutex<Pending>,
    max_sessions: AtomicU64,
    max_buffered: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: u64, max_buffered: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: Registry::new(),
            pending: Mutex::new(Pending::default()),
            max_sessions: AtomicU64::new(max_sessions),
            max_buffered,
        })
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sessions(&self) -> u64 {
        self.max_sessions.load(Ordering::Relaxed)
    }

    pub fn set_max_sessions(&self, max: u64) {
        self.max_sessions.store(max, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether another session fits under the limit, counting reserved slots.
    pub fn has_capacity(&self) -> bool {
        let pending = self.pending();
        self.in_use(&pending) < self.max_sessions()
    }

    fn in_use(&self, pending: &Pending) -> u64 {
        (self.sessions.len() + pending.reserved.len()) as u64
    }

    /// Hold a slot for a session that is about to be accepted.
    ///
    /// The slot is consumed by `register` or given back by `reject`.
    pub(crate) fn try_reserve(&self, session_id: u64) -> H3Result<()> {
        let mut pending = self.pending();
        let max = self.max_sessions();
        if self.in_use(&pending) >= max {
            return Err(SessionError::LimitReached(max).into());
        }
        pending.reserved.insert(session_id);
        Ok(())
    }

    pub fn get(&self, session_id: u64) -> Option<Session> {
        self.sessions.get(&session_id)
    }

    /// Streams waiting for a session that has not opened yet.
    pub fn buffered_len(&self) -> usize {
        self.pending().streams.len()
    }

    /// Add an opening session and hand back the streams buffered for it.
    pub(crate) fn register(&self, session: &Session) -> H3Result<Vec<(WebTransportStream, bool)>> {
        let mut pending = self.pending();
        let id = session.id();
        if !pending.reserved.remove(&id) {
            let max = self.max_sessions();
            if self.in_use(&pending) >= max {
                return Err(SessionError::LimitReached(max).into());
            }
        }
        self.sessions.register(id, session.clone());
        Ok(pending
            .take_streams(id)
            .into_iter()
            .map(|b| (b.stream, b.bidirectional))
            .collect())
    }

    /// Forget a terminated session. Later streams for it are refused.
    pub(crate) fn unregister(&self, session_id: u64) {
        let mut pending = self.pending();
        pending.reserved.remove(&session_id);
        pending.terminate(session_id);
        self.sessions.unregister(&session_id);
    }

    /// Give up on a session that never opened: release its slot and refuse
    /// whatever was buffered for it.
    pub(crate) fn reject(&self, session_id: u64) {
        let streams = {
            let mut pending = self.pending();
            pending.reserved.remove(&session_id);
            pending.terminate(session_id);
            pending.take_streams(session_id)
        };
        for buffered in streams {
            tracing::debug!(
                "Refusing stream {} buffered for rejected session {}",
                buffered.stream.id,
                session_id
            );
            refuse_stream(&buffered.stream, codes::WT_BUFFERED_STREAM_REJECTED);
        }
    }

    /// Route a peer stream to its session, buffering it if the session is unknown.
    pub(crate) fn dispatch(&self, session_id: u64, stream: WebTransportStream, bidirectional: bool) {
        let mut pending = self.pending();
        if pending.terminated.contains(&session_id) {
            drop(pending);
            tracing::debug!("Stream {} for terminated session {}", stream.id, session_id);
            refuse_stream(&stream, codes::WT_SESSION_GONE);
            return;
        }
        if let Some(session) = self.sessions.get(&session_id) {
            drop(pending);
            session.route_incoming(stream, bidirectional);
            return;
        }
        if pending.streams.len() >= self.max_buffered {
            drop(pending);
            tracing::debug!(
                "Rejecting stream {} for unknown session {}: buffer full",
                stream.id,
                session_id
            );
            refuse_stream(&stream, codes::WT_BUFFERED_STREAM_REJECTED);
            return;
        }
        tracing::debug!("Buffering stream {} for session {}", stream.id, session_id);
        pending.streams.push(BufferedStream {
            session_id,
            stream,
            bidirectional,
        });
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (reserved, buffered) = {
            let pending = self.pending();
            (pending.reserved.len(), pending.streams.len())
        };
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("max_sessions", &self.max_sessions())
            .field("reserved", &reserved)
            .field("buffered", &buffered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::H3Error;
    use crate::protocol::stream::HttpStream;
    use crate::transport::memory::MemoryConnection;
    use crate::transport::QuicConnection;
    use crate::webtransport::session::tests::fixture;
    use std::sync::Mutex as StdMutex;

    async fn open_on(conn: &MemoryConnection) -> HttpStream {
        HttpStream::new(conn.open_stream(true).await.unwrap(), 1 << 20)
    }

    #[tokio::test]
    async fn test_buffered_until_open() {
        let fx = fixture().await;
        let first = open_on(&fx.local).await;
        let first_id = first.id;
        fx.registry.dispatch(0, first, true);
        assert_eq!(fx.registry.buffered_len(), 1);

        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        fx.session.set_bidirectional_stream_handler(move |stream| {
            sink.lock().unwrap().push(stream.id);
        });
        fx.session.open().unwrap();
        assert_eq!(fx.registry.buffered_len(), 0);
        assert_eq!(*delivered.lock().unwrap(), vec![first_id]);

        let second = open_on(&fx.local).await;
        let second_id = second.id;
        fx.registry.dispatch(0, second, true);
        assert_eq!(*delivered.lock().unwrap(), vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn test_excess_buffered_streams_rejected() {
        let fx = fixture().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            let stream = open_on(&fx.local).await;
            ids.push(stream.id);
            fx.registry.dispatch(40, stream, true);
        }
        assert_eq!(fx.registry.buffered_len(), 4);
        let rejected = fx.local.stream_control(ids[4]).unwrap();
        assert_eq!(rejected.abort_code(), Some(codes::WT_BUFFERED_STREAM_REJECTED));
        assert_eq!(rejected.reset_code(), Some(codes::WT_BUFFERED_STREAM_REJECTED));
        let kept = fx.local.stream_control(ids[0]).unwrap();
        assert_eq!(kept.reset_code(), None);
    }

    #[tokio::test]
    async fn test_streams_for_closed_session_refused() {
        let fx = fixture().await;
        fx.session.open().unwrap();
        fx.session.close(0, "").await.unwrap();

        let stream = open_on(&fx.local).await;
        let id = stream.id;
        fx.registry.dispatch(0, stream, true);
        assert_eq!(fx.registry.buffered_len(), 0);
        let control = fx.local.stream_control(id).unwrap();
        assert_eq!(control.reset_code(), Some(codes::WT_SESSION_GONE));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let fx = fixture().await;
        fx.registry.set_max_sessions(0);
        assert!(!fx.registry.has_capacity());
        assert!(matches!(
            fx.session.open(),
            Err(H3Error::Session(SessionError::LimitReached(0)))
        ));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_slot_counts_against_limit() {
        let fx = fixture().await;
        fx.registry.set_max_sessions(1);
        fx.registry.try_reserve(0).unwrap();
        assert!(!fx.registry.has_capacity());
        assert!(matches!(
            fx.registry.try_reserve(4),
            Err(H3Error::Session(SessionError::LimitReached(1)))
        ));

        // The reservation is consumed, not counted twice.
        fx.session.open().unwrap();
        assert_eq!(fx.registry.len(), 1);
        assert!(!fx.registry.has_capacity());
    }

    #[tokio::test]
    async fn test_reject_refuses_buffered_streams() {
        let fx = fixture().await;
        fx.registry.set_max_sessions(1);
        fx.registry.try_reserve(8).unwrap();

        let early = open_on(&fx.local).await;
        let early_id = early.id;
        fx.registry.dispatch(8, early, true);
        let other = open_on(&fx.local).await;
        let other_id = other.id;
        fx.registry.dispatch(12, other, true);
        assert_eq!(fx.registry.buffered_len(), 2);

        fx.registry.reject(8);
        assert_eq!(fx.registry.buffered_len(), 1);
        assert!(fx.registry.has_capacity());
        let refused = fx.local.stream_control(early_id).unwrap();
        assert_eq!(refused.reset_code(), Some(codes::WT_BUFFERED_STREAM_REJECTED));
        let kept = fx.local.stream_control(other_id).unwrap();
        assert_eq!(kept.reset_code(), None);

        let late = open_on(&fx.local).await;
        let late_id = late.id;
        fx.registry.dispatch(8, late, true);
        assert_eq!(fx.registry.buffered_len(), 1);
        let gone = fx.local.stream_control(late_id).unwrap();
        assert_eq!(gone.reset_code(), Some(codes::WT_SESSION_GONE));
    }

    #[test]
    fn test_terminated_ids_bounded() {
        let registry = SessionRegistry::new(1, 4);
        let count = TERMINATED_MEMORY as u64 + 10;
        for n in 0..count {
            registry.unregister(n * 4);
        }
        registry.unregister((count - 1) * 4);

        let pending = registry.pending();
        assert_eq!(pending.terminated.len(), TERMINATED_MEMORY);
        assert_eq!(pending.terminated_order.len(), TERMINATED_MEMORY);
        assert!(!pending.terminated.contains(&0));
        assert!(pending.terminated.contains(&((count - 1) * 4)));
    }
}
