//! Configuration types for H3 client and server connections.

use crate::error::{H3Error, H3Result};
use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of WebTransport streams held for a session that has not
/// been established yet.
pub const DEFAULT_MAX_BUFFERED_STREAMS: usize = 4;

/// Size limits applied to each request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLimits {
    /// Upper bound on the accumulated size of HEADERS frames
    pub max_header_size: u64,

    /// Upper bound on the accumulated size of DATA frames
    pub max_data_size: u64,

    /// Upper bound on a single frame's payload
    pub max_frame_size: u64,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            max_data_size: u64::MAX,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl MessageLimits {
    fn validate(&self) -> H3Result<()> {
        if self.max_header_size == 0 {
            return Err(H3Error::config("max_header_size must be greater than zero"));
        }
        if self.max_frame_size == 0 {
            return Err(H3Error::config("max_frame_size must be greater than zero"));
        }
        if usize::try_from(self.max_frame_size).is_err() {
            return Err(H3Error::config("max_frame_size does not fit in memory"));
        }
        Ok(())
    }
}

/// Configuration for H3 client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-message size limits for responses
    pub limits: MessageLimits,

    /// How long to wait for the server's SETTINGS before giving up
    pub settings_timeout: Duration,

    /// Largest body chunk handed out by a response stream
    pub response_chunk_size: usize,

    /// Advertise WebTransport support in SETTINGS
    pub enable_webtransport: bool,

    /// QPACK dynamic table capacity to advertise
    pub qpack_max_table_capacity: u64,

    /// QPACK blocked streams to advertise
    pub qpack_blocked_streams: u64,

    /// Add a reserved setting to SETTINGS
    pub send_grease: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            limits: MessageLimits::default(),
            settings_timeout: Duration::from_secs(10),
            response_chunk_size: 16 * 1024,
            enable_webtransport: true,
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,
            send_grease: false,
        }
    }
}

impl ClientConfig {
    /// Create a new client configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Check the configuration for values the connection cannot work with.
    pub fn validate(&self) -> H3Result<()> {
        self.limits.validate()?;
        if self.settings_timeout.is_zero() {
            return Err(H3Error::config("settings_timeout must be non-zero"));
        }
        if self.response_chunk_size == 0 {
            return Err(H3Error::config("response_chunk_size must be greater than zero"));
        }
        validate_qpack(self.qpack_max_table_capacity, self.qpack_blocked_streams)
    }
}

/// Configuration for H3 server connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Per-message size limits for requests
    pub limits: MessageLimits,

    /// Advertise Extended CONNECT support
    pub enable_connect_protocol: bool,

    /// Concurrent WebTransport sessions to allow; zero disables WebTransport
    pub max_webtransport_sessions: u64,

    /// Streams buffered per not-yet-established session
    pub max_buffered_streams: usize,

    /// QPACK dynamic table capacity to advertise
    pub qpack_max_table_capacity: u64,

    /// QPACK blocked streams to advertise
    pub qpack_blocked_streams: u64,

    /// Add a reserved setting to SETTINGS
    pub send_grease: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: MessageLimits::default(),
            enable_connect_protocol: true,
            max_webtransport_sessions: 1,
            max_buffered_streams: DEFAULT_MAX_BUFFERED_STREAMS,
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,
            send_grease: false,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Check the configuration for values the connection cannot work with.
    pub fn validate(&self) -> H3Result<()> {
        self.limits.validate()?;
        if self.max_webtransport_sessions > 0 && !self.enable_connect_protocol {
            return Err(H3Error::config(
                "WebTransport sessions require enable_connect_protocol",
            ));
        }
        validate_qpack(self.qpack_max_table_capacity, self.qpack_blocked_streams)
    }
}

/// The built-in header codec never uses the dynamic table.
fn validate_qpack(capacity: u64, blocked: u64) -> H3Result<()> {
    if capacity != 0 || blocked != 0 {
        return Err(H3Error::config(
            "QPACK dynamic table is not supported; capacity and blocked streams must be 0",
        ));
    }
    Ok(())
}

/// Builder for client configuration.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the per-message size limits
    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the accumulated header size limit
    pub fn max_header_size(mut self, size: u64) -> Self {
        self.config.limits.max_header_size = size;
        self
    }

    /// Set the accumulated body size limit
    pub fn max_data_size(mut self, size: u64) -> Self {
        self.config.limits.max_data_size = size;
        self
    }

    /// Set the settings timeout
    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings_timeout = timeout;
        self
    }

    /// Set the response chunk size
    pub fn response_chunk_size(mut self, size: usize) -> Self {
        self.config.response_chunk_size = size;
        self
    }

    /// Enable or disable WebTransport
    pub fn enable_webtransport(mut self, enable: bool) -> Self {
        self.config.enable_webtransport = enable;
        self
    }

    /// Enable or disable SETTINGS greasing
    pub fn send_grease(mut self, enable: bool) -> Self {
        self.config.send_grease = enable;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for server configuration.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the per-message size limits
    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the accumulated header size limit
    pub fn max_header_size(mut self, size: u64) -> Self {
        self.config.limits.max_header_size = size;
        self
    }

    /// Set the accumulated body size limit
    pub fn max_data_size(mut self, size: u64) -> Self {
        self.config.limits.max_data_size = size;
        self
    }

    /// Enable or disable Extended CONNECT
    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.config.enable_connect_protocol = enable;
        self
    }

    /// Set the WebTransport session limit
    pub fn max_webtransport_sessions(mut self, max: u64) -> Self {
        self.config.max_webtransport_sessions = max;
        self
    }

    /// Set how many early streams are buffered per session
    pub fn max_buffered_streams(mut self, max: usize) -> Self {
        self.config.max_buffered_streams = max;
        self
    }

    /// Enable or disable SETTINGS greasing
    pub fn send_grease(mut self, enable: bool) -> Self {
        self.config.send_grease = enable;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
        assert_eq!(
            ServerConfig::default().max_buffered_streams,
            DEFAULT_MAX_BUFFERED_STREAMS
        );
    }

    #[test]
    fn test_builders() {
        let client = ClientConfig::builder()
            .settings_timeout(Duration::from_millis(250))
            .response_chunk_size(1024)
            .max_data_size(4096)
            .build();
        assert_eq!(client.settings_timeout, Duration::from_millis(250));
        assert_eq!(client.limits.max_data_size, 4096);

        let server = ServerConfig::builder()
            .max_webtransport_sessions(8)
            .max_header_size(512)
            .build();
        assert_eq!(server.max_webtransport_sessions, 8);
        assert_eq!(server.limits.max_header_size, 512);
    }

    #[test]
    fn test_invalid_configs() {
        let client = ClientConfig::builder().response_chunk_size(0).build();
        assert!(matches!(client.validate(), Err(H3Error::Config(_))));

        let server = ServerConfig::builder()
            .enable_connect_protocol(false)
            .max_webtransport_sessions(1)
            .build();
        assert!(server.validate().is_err());

        let server = ServerConfig {
            qpack_max_table_capacity: 4096,
            ..ServerConfig::default()
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_partial_config_from_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"max_webtransport_sessions": 16, "limits": {"max_header_size": 1024}}"#)
                .unwrap();
        assert_eq!(config.max_webtransport_sessions, 16);
        assert_eq!(config.limits.max_header_size, 1024);
        assert_eq!(config.limits.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.enable_connect_protocol);

        let text = serde_json::to_string(&ClientConfig::default()).unwrap();
        let back: ClientConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ClientConfig::default());
    }
}
