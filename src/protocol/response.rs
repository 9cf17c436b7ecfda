//! HTTP/3 response types, body handling and the server-side response writer.

use crate::error::{H3Error, H3Result};
use crate::protocol::frame::H3Frame;
use crate::protocol::headers::{FieldSection, Headers, PseudoHeaders};
use crate::protocol::qpack::HeaderCodec;
use crate::protocol::stream::StreamWriter;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use http::StatusCode;
use std::sync::Arc;

/// An HTTP/3 response as received by the client.
#[derive(Debug)]
pub struct H3Response {
    /// Response status code
    pub status: StatusCode,

    /// Response headers, with any trailers appended
    pub headers: Headers,

    /// Response body
    pub body: Body,

    /// Response trailers (sent after body)
    pub trailers: Option<Headers>,
}

impl H3Response {
    /// Create a new response with the given status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            trailers: None,
        }
    }

    /// Create a 200 OK response.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|s| s.parse().ok())
    }

    /// Check if the response is successful (2xx status code).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response is a client error (4xx status code).
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response is a server error (5xx status code).
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Get the content type header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Set the response body.
    pub fn with_body<B>(mut self, body: B) -> Self
    where
        B: Into<Body>,
    {
        self.body = body.into();
        self
    }

    /// Append a header to the response.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// HTTP/3 request/response body.
pub enum Body {
    /// Empty body
    Empty,

    /// Body with known bytes
    Bytes(Bytes),

    /// Streaming body; each item is sent as its own DATA frame
    Stream(Box<dyn Stream<Item = H3Result<Bytes>> + Send + Unpin>),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Body::Stream(...)"),
        }
    }
}

impl Body {
    /// Create an empty body.
    pub fn empty() -> Self {
        Body::Empty
    }

    /// Create a body from bytes.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }

    /// Create a body from a stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = H3Result<Bytes>> + Send + Unpin + 'static,
    {
        Body::Stream(Box::new(stream))
    }

    /// Create a body from separate chunks, each sent as its own DATA frame.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + Unpin + 'static,
    {
        Body::Stream(Box::new(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Get the body size if known.
    pub fn size_hint(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        }
    }

    /// Take the next chunk to send, `None` once the body is exhausted.
    pub async fn next_chunk(&mut self) -> H3Result<Option<Bytes>> {
        match self {
            Body::Empty => Ok(None),
            Body::Bytes(_) => match std::mem::replace(self, Body::Empty) {
                Body::Bytes(bytes) => Ok(Some(bytes)),
                _ => Ok(None),
            },
            Body::Stream(stream) => futures::StreamExt::next(stream).await.transpose(),
        }
    }

    /// Convert the body to bytes.
    pub async fn to_bytes(self) -> H3Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = futures::StreamExt::next(&mut stream).await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(vec))
    }
}

impl From<&[u8]> for Body {
    fn from(slice: &[u8]) -> Self {
        Body::Bytes(Bytes::copy_from_slice(slice))
    }
}

impl From<String> for Body {
    fn from(string: String) -> Self {
        Body::Bytes(Bytes::from(string))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

/// How a [`ServerResponse`] puts its status line and headers on the wire.
pub trait HeaderSender: Send + Sync {
    fn send_headers<'a>(
        &'a self,
        writer: &'a mut StreamWriter,
        status: StatusCode,
        headers: &'a Headers,
    ) -> BoxFuture<'a, H3Result<()>>;
}

/// Sends headers as a QPACK-encoded HEADERS frame.
pub struct FrameHeaderSender {
    codec: Arc<dyn HeaderCodec>,
}

impl FrameHeaderSender {
    pub fn new(codec: Arc<dyn HeaderCodec>) -> Self {
        Self { codec }
    }
}

impl HeaderSender for FrameHeaderSender {
    fn send_headers<'a>(
        &'a self,
        writer: &'a mut StreamWriter,
        status: StatusCode,
        headers: &'a Headers,
    ) -> BoxFuture<'a, H3Result<()>> {
        Box::pin(async move {
            let section = FieldSection {
                pseudo: PseudoHeaders {
                    status: Some(status.as_str().to_string()),
                    ..PseudoHeaders::default()
                },
                headers: headers.clone(),
            };
            writer.write_headers(self.codec.as_ref(), &section).await
        })
    }
}

/// Status sent when a handler never sets one.
pub const DEFAULT_STATUS: StatusCode = StatusCode::METHOD_NOT_ALLOWED;

/// Server-side response writer.
///
/// Headers go out lazily: on the first body write, on an explicit
/// [`send_headers`](Self::send_headers) or on [`finish`](Self::finish).
pub struct ServerResponse {
    writer: StreamWriter,
    sender: Arc<dyn HeaderSender>,
    codec: Arc<dyn HeaderCodec>,
    status: Option<StatusCode>,
    headers: Headers,
    headers_sent: bool,
    finished: bool,
    bytes_written: u64,
}

impl ServerResponse {
    pub fn new(writer: StreamWriter, codec: Arc<dyn HeaderCodec>) -> Self {
        let sender = Arc::new(FrameHeaderSender::new(Arc::clone(&codec)));
        Self::with_sender(writer, codec, sender)
    }

    pub fn with_sender(
        writer: StreamWriter,
        codec: Arc<dyn HeaderCodec>,
        sender: Arc<dyn HeaderSender>,
    ) -> Self {
        Self {
            writer,
            sender,
            codec,
            status: None,
            headers: Headers::new(),
            headers_sent: false,
            finished: false,
            bytes_written: 0,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.writer.id()
    }

    fn check_headers_pending(&self) -> H3Result<()> {
        if self.headers_sent {
            return Err(H3Error::illegal_state("response headers already sent"));
        }
        Ok(())
    }

    /// Set the status code. Must lie in 100..=599.
    pub fn set_status(&mut self, status: i32) -> H3Result<()> {
        self.check_headers_pending()?;
        let status = u16::try_from(status)
            .ok()
            .filter(|s| (100..=599).contains(s))
            .and_then(|s| StatusCode::from_u16(s).ok())
            .ok_or_else(|| H3Error::InvalidArgument(format!("invalid status code {status}")))?;
        self.status = Some(status);
        Ok(())
    }

    /// Status set so far.
    pub fn status(&self) -> H3Result<StatusCode> {
        self.status
            .ok_or_else(|| H3Error::illegal_state("response status has not been set"))
    }

    /// Append a header.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> H3Result<()> {
        self.check_headers_pending()?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Replace all values of a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> H3Result<()> {
        self.check_headers_pending()?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Send the status and headers now. A missing status becomes 405.
    pub async fn send_headers(&mut self) -> H3Result<()> {
        self.check_headers_pending()?;
        let status = *self.status.get_or_insert(DEFAULT_STATUS);
        self.headers_sent = true;
        self.sender
            .send_headers(&mut self.writer, status, &self.headers)
            .await
    }

    /// Write a chunk of the body as one DATA frame.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> H3Result<()> {
        if self.finished {
            return Err(H3Error::illegal_state("response already finished"));
        }
        if !self.headers_sent {
            self.send_headers().await?;
        }
        let data = data.into();
        self.bytes_written += data.len() as u64;
        self.writer.write_frame(&H3Frame::Data(data)).await
    }

    /// Send trailers and finish the response.
    pub async fn send_trailers(&mut self, trailers: Headers) -> H3Result<()> {
        if self.finished {
            return Err(H3Error::illegal_state("response already finished"));
        }
        if !self.headers_sent {
            self.send_headers().await?;
        }
        let section = FieldSection {
            pseudo: PseudoHeaders::default(),
            headers: trailers,
        };
        self.writer.write_headers(self.codec.as_ref(), &section).await?;
        self.finish().await
    }

    /// Send any pending headers and FIN. Idempotent.
    pub async fn finish(&mut self) -> H3Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.headers_sent {
            self.send_headers().await?;
        }
        self.finished = true;
        self.writer.finish().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl std::fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerResponse")
            .field("stream", &self.writer.id())
            .field("status", &self.status)
            .field("headers_sent", &self.headers_sent)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::qpack::StaticQpack;
    use crate::protocol::stream::tests::reader_over;
    use crate::protocol::stream::{MessagePart, MessageReader};
    use crate::config::MessageLimits;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    fn response_pair() -> (ServerResponse, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let writer = StreamWriter::new(0, Box::new(local));
        (ServerResponse::new(writer, Arc::new(StaticQpack)), remote)
    }

    async fn read_all(mut remote: tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn parts(wire: Vec<u8>) -> Vec<MessagePart> {
        let mut reader = MessageReader::new(
            reader_over(wire, 7),
            Arc::new(StaticQpack),
            MessageLimits::default(),
        );
        let mut parts = Vec::new();
        while let Some(part) = reader.next_part().await.unwrap() {
            parts.push(part);
        }
        parts
    }

    #[test]
    fn test_response_creation() {
        let response = H3Response::ok()
            .with_header("content-type", "application/json")
            .with_body("{}");

        assert_eq!(response.status, StatusCode::OK);
        assert!(response.is_success());
        assert_eq!(response.content_type(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_body_chunks() {
        let mut body = Body::from_chunks(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")]);
        assert_eq!(body.size_hint(), None);
        assert_eq!(body.next_chunk().await.unwrap(), Some(Bytes::from_static(b"ab")));
        assert_eq!(body.to_bytes().await.unwrap(), Bytes::from_static(b"c"));

        let mut body = Body::from("test data");
        assert_eq!(body.size_hint(), Some(9));
        assert!(body.next_chunk().await.unwrap().is_some());
        assert!(body.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_range() {
        let (mut response, _remote) = response_pair();
        assert!(matches!(response.status(), Err(H3Error::IllegalState(_))));
        for bad in [0, 1000, -1, 99, 600] {
            assert!(matches!(
                response.set_status(bad),
                Err(H3Error::InvalidArgument(_))
            ));
        }
        response.set_status(100).unwrap();
        response.set_status(599).unwrap();
        assert_eq!(response.status().unwrap().as_u16(), 599);
    }

    #[tokio::test]
    async fn test_lazy_headers_and_default_status() {
        let (mut response, remote) = response_pair();
        response.add_header("x-a", "1").unwrap();
        response.finish().await.unwrap();
        assert!(response.headers_sent());
        assert_eq!(response.status().unwrap(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(matches!(
            response.set_status(200),
            Err(H3Error::IllegalState(_))
        ));
        assert!(response.add_header("x-b", "2").is_err());
        response.finish().await.unwrap();

        let parts = parts(read_all(remote).await).await;
        assert_eq!(parts.len(), 1);
        let MessagePart::Headers(fields) = &parts[0] else {
            panic!("expected headers");
        };
        assert_eq!(fields[0].value, "405");
        assert_eq!(fields[1].name, "x-a");
    }

    #[tokio::test]
    async fn test_body_and_trailers() {
        let (mut response, remote) = response_pair();
        response.set_status(200).unwrap();
        response.write("hello ").await.unwrap();
        response.write("world").await.unwrap();
        let mut trailers = Headers::new();
        trailers.append("x-checksum", "abc");
        response.send_trailers(trailers).await.unwrap();
        assert!(response.write("late").await.is_err());
        assert_eq!(response.bytes_written(), 11);

        let parts = parts(read_all(remote).await).await;
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2], MessagePart::Data(Bytes::from_static(b"world")));
        assert!(matches!(&parts[3], MessagePart::Trailers(t) if t[0].name == "x-checksum"));
    }

    struct Recording(Mutex<Vec<u16>>);

    impl HeaderSender for Recording {
        fn send_headers<'a>(
            &'a self,
            _writer: &'a mut StreamWriter,
            status: StatusCode,
            _headers: &'a Headers,
        ) -> BoxFuture<'a, H3Result<()>> {
            self.0.lock().unwrap().push(status.as_u16());
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_custom_header_sender() {
        let (local, _remote) = tokio::io::duplex(1024);
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut response = ServerResponse::with_sender(
            StreamWriter::new(0, Box::new(local)),
            Arc::new(StaticQpack),
            recording.clone(),
        );
        response.set_status(204).unwrap();
        response.send_headers().await.unwrap();
        assert!(response.send_headers().await.is_err());
        assert_eq!(*recording.0.lock().unwrap(), vec![204]);
    }
}
