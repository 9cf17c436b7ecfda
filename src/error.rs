//! Error types and handling for the H3 library.
//!
//! Errors fall into three tiers: connection errors tear down the whole QUIC
//! connection, protocol errors abort a single stream, and local usage errors
//! are reported to the caller and never reach the wire.

use http::StatusCode;
use std::fmt;

/// Result type alias for H3 operations.
pub type H3Result<T> = Result<T, H3Error>;

/// HTTP/3 and WebTransport application error codes.
pub mod codes {
    pub const H3_NO_ERROR: u64 = 0x100;
    pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
    pub const H3_INTERNAL_ERROR: u64 = 0x102;
    pub const H3_STREAM_CREATION_ERROR: u64 = 0x103;
    pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x104;
    pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
    pub const H3_FRAME_ERROR: u64 = 0x106;
    pub const H3_EXCESSIVE_LOAD: u64 = 0x107;
    pub const H3_ID_ERROR: u64 = 0x108;
    pub const H3_SETTINGS_ERROR: u64 = 0x109;
    pub const H3_MISSING_SETTINGS: u64 = 0x10a;
    pub const H3_REQUEST_REJECTED: u64 = 0x10b;
    pub const H3_REQUEST_CANCELLED: u64 = 0x10c;
    pub const H3_REQUEST_INCOMPLETE: u64 = 0x10d;
    pub const H3_MESSAGE_ERROR: u64 = 0x10e;
    pub const H3_CONNECT_ERROR: u64 = 0x10f;

    pub const QPACK_DECOMPRESSION_FAILED: u64 = 0x200;

    /// The WebTransport session the stream belongs to has terminated.
    pub const WT_SESSION_GONE: u64 = 0x170d7b68;
    /// The stream arrived before its session and could not be buffered.
    pub const WT_BUFFERED_STREAM_REJECTED: u64 = 0x3994bd84;

    pub const WT_APPLICATION_ERROR_FIRST: u64 = 0x52e4a40fa8db;
    pub const WT_APPLICATION_ERROR_LAST: u64 = 0x52e5ac983162;

    /// Map a 32-bit WebTransport application error code onto the reserved
    /// HTTP/3 range, skipping the GREASE code points.
    pub fn webtransport_to_http3(code: u32) -> u64 {
        let code = u64::from(code);
        WT_APPLICATION_ERROR_FIRST + code + code / 0x1e
    }

    /// Inverse of [`webtransport_to_http3`]. Returns `None` for codes outside
    /// the range or for GREASE code points.
    pub fn http3_to_webtransport(h3_code: u64) -> Option<u32> {
        if !(WT_APPLICATION_ERROR_FIRST..=WT_APPLICATION_ERROR_LAST).contains(&h3_code) {
            return None;
        }
        if (h3_code - 0x21) % 0x1f == 0 {
            return None;
        }
        let shifted = h3_code - WT_APPLICATION_ERROR_FIRST;
        u32::try_from(shifted - shifted / 0x1f).ok()
    }
}

/// Main error type for H3 operations.
#[derive(Debug, thiserror::Error)]
pub enum H3Error {
    /// Connection-level errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Stream-level protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Stream-related errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Frame and capsule parsing errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Peer does not offer a required capability
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// WebTransport session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The peer answered a CONNECT with a non-2xx status
    #[error("HTTP error: status {0}")]
    Http(StatusCode),

    /// Invalid API use
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors that close the whole connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("First frame on the control stream was not SETTINGS")]
    MissingSettings,

    #[error("Invalid SETTINGS: {0}")]
    Settings(String),

    #[error("Critical stream closed: {0}")]
    ClosedCriticalStream(String),

    #[error("Stream creation error: {0}")]
    StreamCreation(String),

    #[error("Malformed frame on critical stream: {0}")]
    Frame(String),

    #[error("Unexpected frame on control stream: {0:#x}")]
    FrameUnexpected(u64),

    #[error("Peer is going away (last stream id {0})")]
    GoingAway(u64),

    #[error("Connection closed")]
    Closed,
}

/// Errors confined to one request or response stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unexpected frame {frame_type:#x} on message stream")]
    FrameUnexpected { frame_type: u64 },

    #[error("Malformed request: {0}")]
    MalformedRequest(MalformedReason),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("{kind} size {size} exceeds limit {limit}")]
    SizeLimitExceeded {
        kind: SizeKind,
        size: u64,
        limit: u64,
    },

    #[error("Header compression failure: {0}")]
    Qpack(String),

    #[error("Stream ended before a complete message")]
    Incomplete,
}

/// The distinct causes of a malformed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    MissingMethod,
    InvalidMethod,
    MissingScheme,
    MissingPath,
    MissingAuthority,
    DuplicatePseudoHeader,
    UnknownPseudoHeader,
    PseudoHeaderAfterRegular,
    PseudoHeaderInTrailers,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MalformedReason::MissingMethod => "missing :method",
            MalformedReason::InvalidMethod => "invalid :method",
            MalformedReason::MissingScheme => "missing :scheme",
            MalformedReason::MissingPath => "missing :path",
            MalformedReason::MissingAuthority => "missing :authority and Host",
            MalformedReason::DuplicatePseudoHeader => "duplicate pseudo-header",
            MalformedReason::UnknownPseudoHeader => "unknown pseudo-header",
            MalformedReason::PseudoHeaderAfterRegular => "pseudo-header after regular header",
            MalformedReason::PseudoHeaderInTrailers => "pseudo-header in trailers",
        };
        f.write_str(text)
    }
}

/// Which accumulated size limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    Header,
    Data,
}

impl fmt::Display for SizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeKind::Header => f.write_str("Header"),
            SizeKind::Data => f.write_str("Data"),
        }
    }
}

/// Stream-related errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream has no {0} side")]
    MissingHalf(&'static str),

    #[error("Stream reset: {0:#x}")]
    Reset(u64),
}

/// Frame and capsule parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Incomplete data")]
    Incomplete,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("Value {0} does not fit in a variable-length integer")]
    VarIntOverflow(u64),

    #[error("Buffer overflow")]
    BufferOverflow,

    #[error("Capsule message too long: {0} bytes")]
    CapsuleTooLarge(usize),
}

/// The peer does not support something the caller asked for.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Timed out waiting for peer SETTINGS")]
    SettingsTimeout,

    #[error("Peer does not support extended CONNECT")]
    ExtendedConnectUnsupported,

    #[error("Peer does not support WebTransport")]
    WebTransportUnsupported,
}

/// WebTransport session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} is not open")]
    NotOpen(u64),

    #[error("Session limit of {0} reached")]
    LimitReached(u64),
}

impl H3Error {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        H3Error::Config(msg.to_string())
    }

    /// Create a new internal error
    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        H3Error::Internal(msg.to_string())
    }

    /// Create a new illegal-state error
    pub fn illegal_state<T: fmt::Display>(msg: T) -> Self {
        H3Error::IllegalState(msg.to_string())
    }

    /// The HTTP/3 error code to put on the wire for this error.
    pub fn error_code(&self) -> u64 {
        use codes::*;
        match self {
            H3Error::Connection(e) => match e {
                ConnectionError::MissingSettings => H3_MISSING_SETTINGS,
                ConnectionError::Settings(_) => H3_SETTINGS_ERROR,
                ConnectionError::ClosedCriticalStream(_) => H3_CLOSED_CRITICAL_STREAM,
                ConnectionError::StreamCreation(_) => H3_STREAM_CREATION_ERROR,
                ConnectionError::Frame(_) => H3_FRAME_ERROR,
                ConnectionError::FrameUnexpected(_) => H3_FRAME_UNEXPECTED,
                ConnectionError::GoingAway(_) => H3_REQUEST_REJECTED,
                ConnectionError::Closed => H3_NO_ERROR,
            },
            H3Error::Protocol(e) => match e {
                ProtocolError::FrameUnexpected { .. } => H3_FRAME_UNEXPECTED,
                ProtocolError::MalformedRequest(_) | ProtocolError::MalformedResponse(_) => {
                    H3_MESSAGE_ERROR
                }
                ProtocolError::SizeLimitExceeded { .. } => H3_EXCESSIVE_LOAD,
                ProtocolError::Qpack(_) => QPACK_DECOMPRESSION_FAILED,
                ProtocolError::Incomplete => H3_REQUEST_INCOMPLETE,
            },
            H3Error::Parse(ParseError::FrameTooLarge { .. }) => H3_EXCESSIVE_LOAD,
            H3Error::Parse(_) => H3_FRAME_ERROR,
            H3Error::Session(SessionError::LimitReached(_)) => H3_REQUEST_REJECTED,
            H3Error::Stream(StreamError::Reset(code)) => *code,
            _ => H3_INTERNAL_ERROR,
        }
    }

    /// Check if this error should trigger a connection close.
    ///
    /// A failed field section decode leaves the QPACK state unusable, so it
    /// counts as connection-level.
    pub fn should_close_connection(&self) -> bool {
        matches!(
            self,
            H3Error::Connection(_) | H3Error::Protocol(ProtocolError::Qpack(_))
        )
    }

    /// Check if this error reports local misuse and must never reach the wire
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            H3Error::IllegalState(_) | H3Error::InvalidArgument(_) | H3Error::Config(_)
        )
    }
}
