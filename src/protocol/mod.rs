//! HTTP/3 protocol implementation.

pub mod frame;
pub mod headers;
pub mod qpack;
pub mod request;
pub mod response;
pub mod settings;
pub mod stream;
pub mod varint;

pub use frame::{FrameParser, FrameType, H3Frame};
pub use headers::{FieldSection, HeaderField, Headers, PseudoHeaders};
pub use qpack::{HeaderCodec, StaticQpack};
pub use request::{H3Request, H3RequestBuilder, ServerRequest};
pub use response::{Body, H3Response, HeaderSender, ServerResponse};
pub use settings::{SettingId, Settings};
pub use stream::{HttpStream, MessagePart, MessageReader, MessageState, StreamReader, StreamWriter};
