//! Stream I/O for HTTP/3: buffered readers, frame writers and the
//! request/response frame sequencing rules.

use crate::config::MessageLimits;
use crate::error::{H3Result, ParseError, ProtocolError, SizeKind, StreamError};
use crate::protocol::frame::{FrameParser, H3Frame};
use crate::protocol::headers::{FieldSection, HeaderField};
use crate::protocol::qpack::HeaderCodec;
use crate::protocol::varint;
use crate::transport::{QuicStream, RecvHalf, SendHalf, StreamControl};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const READ_RESERVE: usize = 8 * 1024;

/// Buffered reader over the receiving half of a stream.
///
/// Frames, varints and raw bytes can be mixed freely; whatever has been read
/// from the transport but not consumed stays buffered in the parser.
pub struct StreamReader {
    id: u64,
    recv: RecvHalf,
    parser: FrameParser,
    eof: bool,
}

impl StreamReader {
    pub fn new(id: u64, recv: RecvHalf, max_frame_size: u64) -> Self {
        Self {
            id,
            recv,
            parser: FrameParser::with_max_frame_size(max_frame_size),
            eof: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read more bytes from the transport. Returns false at end of stream.
    async fn fill(&mut self) -> H3Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = BytesMut::with_capacity(READ_RESERVE);
        if self.recv.read_buf(&mut chunk).await? == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.parser.feed(&chunk)?;
        Ok(true)
    }

    /// Error for an end of stream in the middle of a unit.
    fn truncated(&self) -> H3Result<()> {
        if self.parser.is_buffer_empty() && !self.parser.is_mid_frame() {
            Ok(())
        } else {
            Err(ParseError::Incomplete.into())
        }
    }

    /// Peek the next varint without consuming it. `None` at a clean end of stream.
    pub async fn peek_varint(&mut self) -> H3Result<Option<u64>> {
        loop {
            if let Some(value) = self.parser.peek_varint() {
                return Ok(Some(value));
            }
            if !self.fill().await? {
                self.truncated()?;
                return Ok(None);
            }
        }
    }

    /// Read the next varint. `None` at a clean end of stream.
    pub async fn read_varint(&mut self) -> H3Result<Option<u64>> {
        loop {
            if let Some(value) = self.parser.take_varint() {
                return Ok(Some(value));
            }
            if !self.fill().await? {
                self.truncated()?;
                return Ok(None);
            }
        }
    }

    /// Read exactly `n` raw bytes.
    pub async fn read_exact(&mut self, n: usize) -> H3Result<Bytes> {
        loop {
            if let Some(bytes) = self.parser.take_bytes(n) {
                return Ok(bytes);
            }
            if !self.fill().await? {
                return Err(ParseError::Incomplete.into());
            }
        }
    }

    /// Read up to `max` raw bytes. `None` at end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> H3Result<Option<Bytes>> {
        if self.parser.is_buffer_empty() && !self.fill().await? {
            return Ok(None);
        }
        Ok(Some(self.parser.take_available(max)))
    }

    /// Read the next complete frame. `None` at a clean end of stream.
    pub async fn read_frame(&mut self) -> H3Result<Option<H3Frame>> {
        loop {
            if let Some(frame) = self.parser.next_frame()? {
                return Ok(Some(frame));
            }
            if !self.fill().await? {
                self.truncated()?;
                return Ok(None);
            }
        }
    }

    /// Discard everything until the end of the stream.
    pub async fn drain(&mut self) -> H3Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.read_chunk(usize::MAX).await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.id)
            .field("buffered", &self.parser.buffer_size())
            .field("eof", &self.eof)
            .finish()
    }
}

/// Writer over the sending half of a stream.
///
/// Each frame or capsule is written with a single `write_all` call.
pub struct StreamWriter {
    id: u64,
    send: SendHalf,
}

impl StreamWriter {
    pub fn new(id: u64, send: SendHalf) -> Self {
        Self { id, send }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn write_frame(&mut self, frame: &H3Frame) -> H3Result<()> {
        let bytes = frame.to_bytes()?;
        self.write_all(&bytes).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> H3Result<()> {
        self.send.write_all(data).await?;
        self.send.flush().await?;
        Ok(())
    }

    /// Write a sequence of varints as one unit (stream type prefixes).
    pub async fn write_varints(&mut self, values: &[u64]) -> H3Result<()> {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for value in values {
            varint::encode(*value, &mut buf)?;
        }
        self.write_all(&buf).await
    }

    /// Compress `section` and write it as a HEADERS frame.
    pub async fn write_headers(
        &mut self,
        codec: &dyn HeaderCodec,
        section: &FieldSection,
    ) -> H3Result<()> {
        let block = codec.compress(&section.to_fields())?;
        self.write_frame(&H3Frame::Headers(block)).await
    }

    /// Send FIN.
    pub async fn finish(&mut self) -> H3Result<()> {
        self.send.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter").field("id", &self.id).finish()
    }
}

/// A QUIC stream wrapped for HTTP/3 use.
pub struct HttpStream {
    pub id: u64,
    pub reader: Option<StreamReader>,
    pub writer: Option<StreamWriter>,
    control: Arc<dyn StreamControl>,
}

impl HttpStream {
    pub fn new(stream: QuicStream, max_frame_size: u64) -> Self {
        let id = stream.id;
        let (recv, send, control) = stream.into_parts();
        Self {
            id,
            reader: recv.map(|r| StreamReader::new(id, r, max_frame_size)),
            writer: send.map(|s| StreamWriter::new(id, s)),
            control,
        }
    }

    /// Reassemble a stream from halves that were taken apart.
    pub fn from_parts(
        id: u64,
        reader: Option<StreamReader>,
        writer: Option<StreamWriter>,
        control: Arc<dyn StreamControl>,
    ) -> Self {
        Self {
            id,
            reader,
            writer,
            control,
        }
    }

    pub fn control(&self) -> Arc<dyn StreamControl> {
        Arc::clone(&self.control)
    }

    pub fn abort_reading(&self, error_code: u64) {
        self.control.abort_reading(error_code);
    }

    pub fn reset_stream(&self, error_code: u64) {
        self.control.reset_stream(error_code);
    }

    /// Take the reader, failing if the stream has no receive half.
    pub fn take_reader(&mut self) -> H3Result<StreamReader> {
        self.reader
            .take()
            .ok_or_else(|| StreamError::MissingHalf("receive").into())
    }

    /// Take the writer, failing if the stream has no send half.
    pub fn take_writer(&mut self) -> H3Result<StreamWriter> {
        self.writer
            .take()
            .ok_or_else(|| StreamError::MissingHalf("send").into())
    }
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("id", &self.id)
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

/// Progress of a request or response through its frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Awaiting the leading HEADERS frame
    AwaitingHeaders,
    /// Leading HEADERS received, no DATA yet
    HeadersReceived,
    /// At least one DATA frame received
    ReceivingBody,
    /// Trailers received or stream ended
    Complete,
}

/// One element of a message, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    Headers(Vec<HeaderField>),
    Data(Bytes),
    Trailers(Vec<HeaderField>),
}

/// Reads one HTTP message off a stream, enforcing frame order and size limits.
///
/// Unknown frame types are skipped wherever they appear.
pub struct MessageReader {
    reader: StreamReader,
    codec: Arc<dyn HeaderCodec>,
    limits: MessageLimits,
    state: MessageState,
    header_bytes: u64,
    data_bytes: u64,
}

impl MessageReader {
    pub fn new(reader: StreamReader, codec: Arc<dyn HeaderCodec>, limits: MessageLimits) -> Self {
        Self {
            reader,
            codec,
            limits,
            state: MessageState::AwaitingHeaders,
            header_bytes: 0,
            data_bytes: 0,
        }
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Expect another leading HEADERS frame after an informational (1xx) one.
    pub fn await_final_headers(&mut self) {
        if self.state == MessageState::HeadersReceived {
            self.state = MessageState::AwaitingHeaders;
        }
    }

    /// Give back the underlying reader, with any unconsumed bytes still buffered.
    pub fn into_inner(self) -> StreamReader {
        self.reader
    }

    fn account(&mut self, kind: SizeKind, len: usize) -> H3Result<()> {
        let (total, limit) = match kind {
            SizeKind::Header => (&mut self.header_bytes, self.limits.max_header_size),
            SizeKind::Data => (&mut self.data_bytes, self.limits.max_data_size),
        };
        *total += len as u64;
        if *total > limit {
            return Err(ProtocolError::SizeLimitExceeded {
                kind,
                size: *total,
                limit,
            }
            .into());
        }
        Ok(())
    }

    fn unexpected(frame: &H3Frame) -> H3Result<Option<MessagePart>> {
        Err(ProtocolError::FrameUnexpected {
            frame_type: frame.frame_type(),
        }
        .into())
    }

    /// Next element of the message, or `None` once the stream has ended.
    pub async fn next_part(&mut self) -> H3Result<Option<MessagePart>> {
        loop {
            let Some(frame) = self.reader.read_frame().await? else {
                if self.state == MessageState::AwaitingHeaders {
                    return Ok(None);
                }
                self.state = MessageState::Complete;
                return Ok(None);
            };

            match (&frame, self.state) {
                (H3Frame::Unknown { frame_type, payload }, _) => {
                    tracing::debug!(
                        "Skipping unknown frame {:#x} ({} bytes) on stream {}",
                        frame_type,
                        payload.len(),
                        self.reader.id()
                    );
                }
                (H3Frame::Headers(block), MessageState::AwaitingHeaders) => {
                    self.account(SizeKind::Header, block.len())?;
                    let fields = self.codec.decompress(block)?;
                    self.state = MessageState::HeadersReceived;
                    return Ok(Some(MessagePart::Headers(fields)));
                }
                (H3Frame::Headers(block), MessageState::ReceivingBody) => {
                    self.account(SizeKind::Header, block.len())?;
                    let fields = self.codec.decompress(block)?;
                    self.state = MessageState::Complete;
                    return Ok(Some(MessagePart::Trailers(fields)));
                }
                (
                    H3Frame::Data(payload),
                    MessageState::HeadersReceived | MessageState::ReceivingBody,
                ) => {
                    self.account(SizeKind::Data, payload.len())?;
                    self.state = MessageState::ReceivingBody;
                    return Ok(Some(MessagePart::Data(payload.clone())));
                }
                _ => return Self::unexpected(&frame),
            }
        }
    }

    /// Read the leading HEADERS frame. Fails if the stream ends first.
    pub async fn read_headers(&mut self) -> H3Result<Vec<HeaderField>> {
        match self.next_part().await? {
            Some(MessagePart::Headers(fields)) => Ok(fields),
            Some(_) => Err(ProtocolError::FrameUnexpected { frame_type: 0x00 }.into()),
            None => Err(ProtocolError::Incomplete.into()),
        }
    }
}

impl fmt::Debug for MessageReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReader")
            .field("stream", &self.reader.id())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::H3Error;
    use crate::protocol::qpack::StaticQpack;

    /// A reader over a fixed byte sequence, delivered in `chunk`-sized reads.
    pub(crate) fn reader_over(bytes: Vec<u8>, chunk: usize) -> StreamReader {
        let (mut tx, rx) = tokio::io::duplex(chunk.max(1));
        tokio::spawn(async move {
            for piece in bytes.chunks(chunk.max(1)) {
                if tx.write_all(piece).await.is_err() {
                    return;
                }
            }
            let _ = tx.shutdown().await;
        });
        StreamReader::new(0, Box::new(rx), 1 << 20)
    }

    pub(crate) fn headers_frame(pairs: &[(&str, &str)]) -> Vec<u8> {
        let fields: Vec<HeaderField> = pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect();
        let block = StaticQpack.compress(&fields).unwrap();
        H3Frame::Headers(block).to_bytes().unwrap().to_vec()
    }

    pub(crate) fn data_frame(payload: &[u8]) -> Vec<u8> {
        H3Frame::Data(Bytes::copy_from_slice(payload))
            .to_bytes()
            .unwrap()
            .to_vec()
    }

    fn message(bytes: Vec<u8>, limits: MessageLimits) -> MessageReader {
        MessageReader::new(reader_over(bytes, 3), Arc::new(StaticQpack), limits)
    }

    async fn collect(reader: &mut MessageReader) -> H3Result<Vec<MessagePart>> {
        let mut parts = Vec::new();
        while let Some(part) = reader.next_part().await? {
            parts.push(part);
        }
        Ok(parts)
    }

    #[tokio::test]
    async fn test_headers_data_trailers() {
        let mut wire = headers_frame(&[(":status", "200"), ("a", "1")]);
        wire.extend(data_frame(b"xy"));
        wire.extend(data_frame(b"z"));
        wire.extend(headers_frame(&[("b", "2")]));

        let mut reader = message(wire, MessageLimits::default());
        let parts = collect(&mut reader).await.unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], MessagePart::Data(Bytes::from_static(b"xy")));
        assert_eq!(parts[3], MessagePart::Trailers(vec![HeaderField::new("b", "2")]));
        assert_eq!(reader.state(), MessageState::Complete);
    }

    #[tokio::test]
    async fn test_data_before_headers_fails() {
        let mut wire = data_frame(b"x");
        wire.extend(headers_frame(&[(":status", "200")]));
        let err = collect(&mut message(wire, MessageLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            H3Error::Protocol(ProtocolError::FrameUnexpected { frame_type: 0x00 })
        ));
    }

    #[tokio::test]
    async fn test_headers_headers_fails() {
        let mut wire = headers_frame(&[(":status", "200")]);
        wire.extend(headers_frame(&[("x", "y")]));
        let err = collect(&mut message(wire, MessageLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            H3Error::Protocol(ProtocolError::FrameUnexpected { frame_type: 0x01 })
        ));
    }

    #[tokio::test]
    async fn test_frame_after_trailers_fails() {
        let mut wire = headers_frame(&[(":status", "200")]);
        wire.extend(data_frame(b"x"));
        wire.extend(headers_frame(&[("t", "1")]));
        wire.extend(data_frame(b"y"));
        assert!(collect(&mut message(wire, MessageLimits::default()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_frame_skipped() {
        let mut wire = headers_frame(&[(":status", "200")]);
        wire.extend([0x3f, 0x03, 0xAA, 0xBB, 0xCC]);
        wire.extend(data_frame(b"payload"));

        let parts = collect(&mut message(wire, MessageLimits::default()))
            .await
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], MessagePart::Data(Bytes::from_static(b"payload")));
    }

    #[tokio::test]
    async fn test_accumulated_data_limit() {
        let mut wire = headers_frame(&[(":status", "200")]);
        wire.extend(data_frame(&[0u8; 6]));
        wire.extend(data_frame(&[0u8; 6]));
        let limits = MessageLimits {
            max_data_size: 10,
            ..MessageLimits::default()
        };
        let err = collect(&mut message(wire, limits)).await.unwrap_err();
        assert!(matches!(
            err,
            H3Error::Protocol(ProtocolError::SizeLimitExceeded {
                kind: SizeKind::Data,
                size: 12,
                limit: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_accumulated_header_limit() {
        let mut wire = headers_frame(&[(":status", "200"), ("x", &"a".repeat(40))]);
        wire.extend(data_frame(b"x"));
        wire.extend(headers_frame(&[("y", &"b".repeat(40))]));
        let limits = MessageLimits {
            max_header_size: 60,
            ..MessageLimits::default()
        };
        let err = collect(&mut message(wire, limits)).await.unwrap_err();
        assert!(matches!(
            err,
            H3Error::Protocol(ProtocolError::SizeLimitExceeded {
                kind: SizeKind::Header,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_format_error() {
        let mut wire = headers_frame(&[(":status", "200")]);
        wire.extend([0x00, 0x05, 0x01]);
        let err = collect(&mut message(wire, MessageLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::Parse(ParseError::Incomplete)));
    }

    #[tokio::test]
    async fn test_reader_mixes_varints_and_raw_bytes() {
        let mut reader = reader_over(vec![0x40, 0x41, 0x04, b'h', b'i', b'!'], 1);
        assert_eq!(reader.peek_varint().await.unwrap(), Some(0x41));
        assert_eq!(reader.read_varint().await.unwrap(), Some(0x41));
        assert_eq!(reader.read_varint().await.unwrap(), Some(4));
        assert_eq!(reader.read_exact(2).await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(reader.read_chunk(10).await.unwrap(), Some(Bytes::from_static(b"!")));
        assert_eq!(reader.read_chunk(10).await.unwrap(), None);
        assert_eq!(reader.read_varint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_buffer_is_bounded() {
        let (mut tx, rx) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = tx.write_all(&vec![0u8; 70_000]).await;
            let _ = tx.shutdown().await;
        });
        // Buffer cap is the frame cap plus 64 KiB.
        let mut reader = StreamReader::new(0, Box::new(rx), 16);
        let err = reader.read_exact(70_000).await.unwrap_err();
        assert!(matches!(err, H3Error::Parse(ParseError::BufferOverflow)));
        assert_eq!(reader.parser.stats().buffer_overflows, 1);
    }
}
