//! HTTP/3 frame parsing and encoding.

use crate::error::{ConnectionError, H3Result, ParseError};
use crate::protocol::settings::Settings;
use crate::protocol::varint;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// HTTP/3 frame types understood by this crate (RFC 9114 section 7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum FrameType {
    /// DATA frame (0x00) - carries request/response body
    Data = 0x00,
    /// HEADERS frame (0x01) - carries an encoded field section
    Headers = 0x01,
    /// SETTINGS frame (0x04) - carries connection settings
    Settings = 0x04,
    /// GOAWAY frame (0x07) - graceful connection termination
    Goaway = 0x07,
}

impl TryFrom<u64> for FrameType {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Headers),
            0x04 => Ok(FrameType::Settings),
            0x07 => Ok(FrameType::Goaway),
            other => Err(other),
        }
    }
}

impl From<FrameType> for u64 {
    fn from(frame_type: FrameType) -> Self {
        frame_type as u64
    }
}

/// Frame types defined by HTTP/2 that have no meaning in HTTP/3.
pub const RESERVED_H2_FRAME_TYPES: [u64; 4] = [0x02, 0x06, 0x08, 0x09];

/// HTTP/3 frame representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Frame {
    /// DATA frame payload
    Data(Bytes),
    /// HEADERS frame carrying a compressed field section
    Headers(Bytes),
    /// SETTINGS frame
    Settings(Settings),
    /// GOAWAY frame with the last stream or push id
    Goaway(u64),
    /// Any frame type this crate does not interpret
    Unknown { frame_type: u64, payload: Bytes },
}

impl H3Frame {
    /// Wire type of this frame.
    pub fn frame_type(&self) -> u64 {
        match self {
            H3Frame::Data(_) => FrameType::Data.into(),
            H3Frame::Headers(_) => FrameType::Headers.into(),
            H3Frame::Settings(_) => FrameType::Settings.into(),
            H3Frame::Goaway(_) => FrameType::Goaway.into(),
            H3Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            H3Frame::Data(payload) | H3Frame::Headers(payload) => payload.len(),
            H3Frame::Settings(settings) => settings.encoded_len(),
            H3Frame::Goaway(id) => varint::encoded_len(*id),
            H3Frame::Unknown { payload, .. } => payload.len(),
        }
    }

    /// Total encoded size including the type and length prefix.
    pub fn encoded_len(&self) -> usize {
        let payload_len = self.payload_len();
        varint::encoded_len(self.frame_type()) + varint::encoded_len(payload_len as u64) + payload_len
    }

    /// Append the encoded frame to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), ParseError> {
        varint::encode(self.frame_type(), buf)?;
        varint::encode(self.payload_len() as u64, buf)?;
        match self {
            H3Frame::Data(payload) | H3Frame::Headers(payload) => buf.put_slice(payload),
            H3Frame::Settings(settings) => settings.encode(buf)?,
            H3Frame::Goaway(id) => varint::encode(*id, buf)?,
            H3Frame::Unknown { payload, .. } => buf.put_slice(payload),
        }
        Ok(())
    }

    /// Encode the frame into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ParseError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn from_payload(frame_type: u64, payload: Bytes) -> H3Result<Self> {
        if RESERVED_H2_FRAME_TYPES.contains(&frame_type) {
            return Err(ConnectionError::FrameUnexpected(frame_type).into());
        }
        let frame = match FrameType::try_from(frame_type) {
            Ok(FrameType::Data) => H3Frame::Data(payload),
            Ok(FrameType::Headers) => H3Frame::Headers(payload),
            Ok(FrameType::Settings) => H3Frame::Settings(Settings::decode(&payload)?),
            Ok(FrameType::Goaway) => {
                let mut cursor = &payload[..];
                let id = varint::decode(&mut cursor)?;
                if cursor.has_remaining() {
                    return Err(ParseError::InvalidFormat("trailing bytes in GOAWAY".into()).into());
                }
                H3Frame::Goaway(id)
            }
            Err(frame_type) => H3Frame::Unknown { frame_type, payload },
        };
        Ok(frame)
    }
}

/// Parser state for incremental frame parsing.
#[derive(Debug, Clone, Copy)]
enum ParserState {
    /// Waiting for frame header (type + length)
    WaitingHeader,
    /// Reading frame payload
    ReadingPayload { frame_type: u64, length: usize },
}

/// Incremental HTTP/3 frame parser.
///
/// Bytes are pushed in whatever chunks the transport delivers; complete
/// frames are pulled out with [`FrameParser::next_frame`]. Between frames the
/// buffered bytes can also be consumed raw (stream type prefixes, signal
/// values, capsules) with the `peek_varint`/`take_*` helpers.
#[derive(Debug)]
pub struct FrameParser {
    /// Internal buffer for incomplete frames
    buffer: BytesMut,
    /// Current parser state
    state: ParserState,
    /// Maximum allowed frame payload size
    max_frame_size: u64,
    /// Maximum buffer size to prevent memory exhaustion
    max_buffer_size: usize,
    /// Statistics for monitoring
    stats: ParserStats,
}

/// Parser statistics for monitoring and debugging.
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    /// Total frames parsed successfully
    pub frames_parsed: u64,
    /// Total bytes processed
    pub bytes_processed: u64,
    /// Parse errors encountered
    pub parse_errors: u64,
    /// Buffer overflows
    pub buffer_overflows: u64,
}

/// Default cap on a single frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

impl FrameParser {
    /// Create a new frame parser with default settings.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame parser with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u64) -> Self {
        let max_buffer_size = usize::try_from(max_frame_size)
            .unwrap_or(usize::MAX)
            .saturating_add(64 * 1024);
        Self::with_config(max_frame_size, max_buffer_size)
    }

    /// Create a new frame parser with custom settings.
    pub fn with_config(max_frame_size: u64, max_buffer_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ParserState::WaitingHeader,
            max_frame_size,
            max_buffer_size,
            stats: ParserStats::default(),
        }
    }

    /// Get parser statistics.
    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a frame header was consumed and its payload is still pending.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, ParserState::ReadingPayload { .. })
    }

    /// Append raw bytes to the parser buffer.
    pub fn feed(&mut self, data: &[u8]) -> H3Result<()> {
        if self.buffer.len() + data.len() > self.max_buffer_size {
            self.stats.buffer_overflows += 1;
            return Err(ParseError::BufferOverflow.into());
        }
        self.buffer.extend_from_slice(data);
        self.stats.bytes_processed += data.len() as u64;
        Ok(())
    }

    /// Parse the next complete frame from already buffered bytes.
    pub fn next_frame(&mut self) -> H3Result<Option<H3Frame>> {
        loop {
            match self.state {
                ParserState::WaitingHeader => match self.try_parse_header() {
                    Ok(Some((frame_type, length))) => {
                        self.state = ParserState::ReadingPayload { frame_type, length };
                    }
                    Ok(None) => return Ok(None),
                    Err(e) => {
                        self.stats.parse_errors += 1;
                        return Err(e);
                    }
                },
                ParserState::ReadingPayload { frame_type, length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(length).freeze();
                    self.state = ParserState::WaitingHeader;
                    return match H3Frame::from_payload(frame_type, payload) {
                        Ok(frame) => {
                            self.stats.frames_parsed += 1;
                            Ok(Some(frame))
                        }
                        Err(e) => {
                            self.stats.parse_errors += 1;
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Try to parse a frame header from the buffer.
    fn try_parse_header(&mut self) -> H3Result<Option<(u64, usize)>> {
        let Some((frame_type, type_len)) = varint::peek(&self.buffer) else {
            return Ok(None);
        };
        let Some((length, len_len)) = varint::peek(&self.buffer[type_len..]) else {
            return Ok(None);
        };
        if length > self.max_frame_size {
            return Err(ParseError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            }
            .into());
        }
        self.buffer.advance(type_len + len_len);
        // Bounded by max_frame_size, which fits in usize via with_max_frame_size.
        let length = usize::try_from(length).map_err(|_| ParseError::BufferOverflow)?;
        Ok(Some((frame_type, length)))
    }

    /// Peek a varint at the front of the buffer without consuming it.
    pub fn peek_varint(&self) -> Option<u64> {
        varint::peek(&self.buffer).map(|(value, _)| value)
    }

    /// Consume a varint from the front of the buffer.
    pub fn take_varint(&mut self) -> Option<u64> {
        let (value, len) = varint::peek(&self.buffer)?;
        self.buffer.advance(len);
        Some(value)
    }

    /// Consume exactly `n` raw bytes, if buffered.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if self.buffer.len() < n {
            return None;
        }
        Some(self.buffer.split_to(n).freeze())
    }

    /// Consume up to `max` buffered raw bytes.
    pub fn take_available(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::H3Error;
    use crate::protocol::settings::SettingId;

    fn data_frames() -> Vec<u8> {
        vec![0x00, 0x01, 0xCA, 0x00, 0x02, 0xFE, 0xBA, 0x00, 0x01, 0xBE]
    }

    /// Feed `data` and drain every complete frame.
    fn drain(parser: &mut FrameParser, data: &[u8]) -> H3Result<Vec<H3Frame>> {
        parser.feed(data)?;
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x00), Ok(FrameType::Data));
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Headers));
        assert_eq!(FrameType::try_from(0x04), Ok(FrameType::Settings));
        assert_eq!(FrameType::try_from(0x07), Ok(FrameType::Goaway));
        assert_eq!(FrameType::try_from(0x3f), Err(0x3f));
        assert_eq!(u64::from(FrameType::Settings), 0x04);
    }

    #[test]
    fn test_data_reassembly_any_chunk_size() {
        let wire = data_frames();
        for chunk_size in 1..=wire.len() {
            let mut parser = FrameParser::new();
            let mut body = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                for frame in drain(&mut parser, chunk).unwrap() {
                    match frame {
                        H3Frame::Data(payload) => body.extend_from_slice(&payload),
                        other => panic!("unexpected frame {other:?}"),
                    }
                }
            }
            assert_eq!(body, vec![0xCA, 0xFE, 0xBA, 0xBE], "chunk size {chunk_size}");
            assert!(parser.is_buffer_empty());
            assert_eq!(parser.stats().frames_parsed, 3);
        }
    }

    #[test]
    fn test_unknown_frame_surfaces_raw() {
        let mut parser = FrameParser::new();
        let frames = drain(&mut parser, &[0x3f, 0x03, 0x01, 0x02, 0x03, 0x00, 0x01, 0xAA]).unwrap();
        assert_eq!(
            frames,
            vec![
                H3Frame::Unknown {
                    frame_type: 0x3f,
                    payload: Bytes::from_static(&[1, 2, 3]),
                },
                H3Frame::Data(Bytes::from_static(&[0xAA])),
            ]
        );
    }

    #[test]
    fn test_reserved_h2_frame_rejected() {
        let mut parser = FrameParser::new();
        let err = drain(&mut parser, &[0x06, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            H3Error::Connection(ConnectionError::FrameUnexpected(0x06))
        ));
        assert_eq!(parser.stats().parse_errors, 1);
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::with_max_frame_size(4);
        let err = drain(&mut parser, &[0x00, 0x05]).unwrap_err();
        assert!(matches!(
            err,
            H3Error::Parse(ParseError::FrameTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_buffer_overflow() {
        let mut parser = FrameParser::with_config(16, 8);
        assert!(parser.feed(&[0u8; 9]).is_err());
        assert_eq!(parser.stats().buffer_overflows, 1);
    }

    #[test]
    fn test_settings_and_goaway_encode_parse() {
        let mut settings = Settings::new();
        settings.insert(SettingId::EnableConnectProtocol, 1);
        let mut wire = BytesMut::new();
        H3Frame::Settings(settings.clone()).encode(&mut wire).unwrap();
        H3Frame::Goaway(8).encode(&mut wire).unwrap();

        let mut parser = FrameParser::new();
        let frames = drain(&mut parser, &wire).unwrap();
        assert_eq!(frames, vec![H3Frame::Settings(settings), H3Frame::Goaway(8)]);
    }

    #[test]
    fn test_raw_access_between_frames() {
        let mut parser = FrameParser::new();
        parser.feed(&[0x40, 0x41, 0x04, 0x00, 0x01, 0x7f]).unwrap();
        assert_eq!(parser.peek_varint(), Some(0x41));
        assert_eq!(parser.take_varint(), Some(0x41));
        assert_eq!(parser.take_varint(), Some(0x04));
        assert_eq!(
            parser.next_frame().unwrap(),
            Some(H3Frame::Data(Bytes::from_static(&[0x7f])))
        );
    }

    #[test]
    fn test_encoded_len_matches() {
        let frame = H3Frame::Headers(Bytes::from(vec![0u8; 100]));
        assert_eq!(frame.to_bytes().unwrap().len(), frame.encoded_len());
    }
}
