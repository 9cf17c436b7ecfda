//! # h3-wt - HTTP/3 and WebTransport over a pluggable QUIC transport
//!
//! HTTP/3 message semantics (RFC 9114) and WebTransport sessions on top of
//! any QUIC implementation that can expose streams as `AsyncRead` and
//! `AsyncWrite` halves.
//!
//! ## Features
//!
//! - **Client Support**: requests with streamed bodies, trailers, CONNECT and Extended CONNECT
//! - **Server Support**: request dispatch with size limits and pluggable CONNECT extensions
//! - **WebTransport**: sessions, capsules and session-bound streams
//! - **Transport-agnostic**: bring your own QUIC stack, or use the in-memory pair for tests
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use h3_wt::transport::memory;
//! use h3_wt::{ClientConfig, H3Client, H3Request};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client_end, _server_end) = memory::pair();
//!     let client = H3Client::connect(client_end.connection, ClientConfig::default()).await?;
//!
//!     let request = H3Request::get("https://example.com/api/data").build()?;
//!     let response = client.send_request(request).await?;
//!
//!     println!("Status: {}", response.status);
//!     Ok(())
//! }
//! ```

pub mod capsule;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod webtransport;

// Re-export main types for convenience
pub use client::{ConnectStream, H3Client, ResponseStream};
pub use config::{ClientConfig, MessageLimits, ServerConfig};
pub use error::{H3Error, H3Result};
pub use server::{H3Server, RequestHandler};
pub use webtransport::{Session, WebTransportClient, WebTransportServer};

// Re-export protocol types
pub use protocol::{Body, H3Frame, H3Request, H3Response, Headers, ServerRequest, ServerResponse};

// Re-export common HTTP types
pub use http::{Method, StatusCode, Uri};
