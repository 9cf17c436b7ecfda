//! Capsule protocol on an Extended CONNECT stream.
//!
//! Capsules are type-length-value records written directly on the stream
//! after the response HEADERS. WebTransport uses two of them to signal the
//! end of a session.

use crate::error::{H3Result, ParseError};
use crate::protocol::stream::{StreamReader, StreamWriter};
use crate::protocol::varint;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const CLOSE_WEBTRANSPORT_SESSION: u64 = 0x2843;
pub const DRAIN_WEBTRANSPORT_SESSION: u64 = 0x78ae;

/// Longest error message a CLOSE_WEBTRANSPORT_SESSION may carry, in bytes.
pub const MAX_CLOSE_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    CloseSession { code: u32, message: String },
    Drain,
    /// Any capsule type without a registered parser
    Generic { capsule_type: u64, payload: Bytes },
}

impl Capsule {
    pub fn capsule_type(&self) -> u64 {
        match self {
            Capsule::CloseSession { .. } => CLOSE_WEBTRANSPORT_SESSION,
            Capsule::Drain => DRAIN_WEBTRANSPORT_SESSION,
            Capsule::Generic { capsule_type, .. } => *capsule_type,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Capsule::CloseSession { message, .. } => 4 + message.len(),
            Capsule::Drain => 0,
            Capsule::Generic { payload, .. } => payload.len(),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> H3Result<()> {
        if let Capsule::CloseSession { message, .. } = self {
            if message.len() > MAX_CLOSE_MESSAGE_LEN {
                return Err(ParseError::CapsuleTooLarge(message.len()).into());
            }
        }
        varint::encode(self.capsule_type(), buf)?;
        varint::encode(self.payload_len() as u64, buf)?;
        match self {
            Capsule::CloseSession { code, message } => {
                buf.put_u32(*code);
                buf.put_slice(message.as_bytes());
            }
            Capsule::Drain => {}
            Capsule::Generic { payload, .. } => buf.put_slice(payload),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> H3Result<Bytes> {
        let mut buf = BytesMut::with_capacity(16 + self.payload_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Turns the payload of one capsule type into a [`Capsule`].
pub trait CapsuleParser: Send + Sync {
    fn parse(&self, capsule_type: u64, payload: Bytes) -> H3Result<Capsule>;
}

struct CloseSessionParser;

impl CapsuleParser for CloseSessionParser {
    fn parse(&self, _capsule_type: u64, payload: Bytes) -> H3Result<Capsule> {
        if payload.len() < 4 {
            return Err(ParseError::InvalidFormat(format!(
                "CLOSE_WEBTRANSPORT_SESSION payload of {} bytes",
                payload.len()
            ))
            .into());
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let message = &payload[4..];
        if message.len() > MAX_CLOSE_MESSAGE_LEN {
            return Err(ParseError::CapsuleTooLarge(message.len()).into());
        }
        let message = std::str::from_utf8(message)
            .map_err(|_| ParseError::InvalidFormat("close message is not UTF-8".into()))?;
        Ok(Capsule::CloseSession {
            code,
            message: message.to_string(),
        })
    }
}

struct DrainParser;

impl CapsuleParser for DrainParser {
    fn parse(&self, _capsule_type: u64, payload: Bytes) -> H3Result<Capsule> {
        if !payload.is_empty() {
            return Err(
                ParseError::InvalidFormat("DRAIN_WEBTRANSPORT_SESSION with payload".into()).into(),
            );
        }
        Ok(Capsule::Drain)
    }
}

/// Receiving side of a capsule stream.
pub struct CapsuleReader {
    reader: StreamReader,
    parsers: HashMap<u64, Arc<dyn CapsuleParser>>,
    max_capsule_size: u64,
}

impl CapsuleReader {
    /// A reader that knows the WebTransport session capsules.
    pub fn new(reader: StreamReader, max_capsule_size: u64) -> Self {
        let mut parsers: HashMap<u64, Arc<dyn CapsuleParser>> = HashMap::new();
        parsers.insert(CLOSE_WEBTRANSPORT_SESSION, Arc::new(CloseSessionParser));
        parsers.insert(DRAIN_WEBTRANSPORT_SESSION, Arc::new(DrainParser));
        Self {
            reader,
            parsers,
            max_capsule_size,
        }
    }

    pub fn register_parser(&mut self, capsule_type: u64, parser: Arc<dyn CapsuleParser>) {
        self.parsers.insert(capsule_type, parser);
    }

    /// Next capsule, or `None` at a clean end of stream.
    pub async fn receive(&mut self) -> H3Result<Option<Capsule>> {
        if self.reader.peek_varint().await?.is_none() {
            return Ok(None);
        }
        let capsule_type = self.reader.read_varint().await?.ok_or(ParseError::Incomplete)?;
        let length = self.reader.read_varint().await?.ok_or(ParseError::Incomplete)?;
        if length > self.max_capsule_size {
            return Err(ParseError::FrameTooLarge {
                size: length,
                max: self.max_capsule_size,
            }
            .into());
        }
        let payload = self.reader.read_exact(length as usize).await?;
        match self.parsers.get(&capsule_type) {
            Some(parser) => parser.parse(capsule_type, payload).map(Some),
            None => Ok(Some(Capsule::Generic {
                capsule_type,
                payload,
            })),
        }
    }
}

impl fmt::Debug for CapsuleReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleReader")
            .field("stream", &self.reader.id())
            .field("parsers", &self.parsers.len())
            .finish()
    }
}

/// Sending side of a capsule stream.
#[derive(Debug)]
pub struct CapsuleWriter {
    writer: StreamWriter,
}

impl CapsuleWriter {
    pub fn new(writer: StreamWriter) -> Self {
        Self { writer }
    }

    /// Write one capsule in a single write.
    pub async fn send(&mut self, capsule: &Capsule) -> H3Result<()> {
        let bytes = capsule.to_bytes()?;
        self.writer.write_all(&bytes).await
    }

    /// Write one capsule, then FIN.
    pub async fn send_and_close(&mut self, capsule: &Capsule) -> H3Result<()> {
        self.send(capsule).await?;
        self.writer.finish().await
    }

    /// FIN without a capsule.
    pub async fn close(&mut self) -> H3Result<()> {
        self.writer.finish().await
    }
}

/// A CONNECT stream speaking the capsule protocol in both directions.
#[derive(Debug)]
pub struct CapsuleStream {
    reader: CapsuleReader,
    writer: CapsuleWriter,
}

impl CapsuleStream {
    pub fn new(reader: StreamReader, writer: StreamWriter, max_capsule_size: u64) -> Self {
        Self {
            reader: CapsuleReader::new(reader, max_capsule_size),
            writer: CapsuleWriter::new(writer),
        }
    }

    pub fn register_parser(&mut self, capsule_type: u64, parser: Arc<dyn CapsuleParser>) {
        self.reader.register_parser(capsule_type, parser);
    }

    pub async fn receive(&mut self) -> H3Result<Option<Capsule>> {
        self.reader.receive().await
    }

    pub async fn send(&mut self, capsule: &Capsule) -> H3Result<()> {
        self.writer.send(capsule).await
    }

    pub async fn send_and_close(&mut self, capsule: &Capsule) -> H3Result<()> {
        self.writer.send_and_close(capsule).await
    }

    /// Split so that one task can receive while another sends.
    pub fn split(self) -> (CapsuleReader, CapsuleWriter) {
        (self.reader, self.writer)
    }
}
