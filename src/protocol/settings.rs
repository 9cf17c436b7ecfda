//! HTTP/3 SETTINGS parameters.

use crate::error::{ConnectionError, H3Result, ParseError};
use crate::protocol::varint;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Well-known setting identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum SettingId {
    /// QPACK maximum table capacity
    QpackMaxTableCapacity = 0x01,
    /// Maximum field section size
    MaxFieldSectionSize = 0x06,
    /// QPACK blocked streams
    QpackBlockedStreams = 0x07,
    /// Extended CONNECT support (RFC 9220)
    EnableConnectProtocol = 0x08,
    /// HTTP datagram support (RFC 9297)
    H3Datagram = 0x33,
    /// Maximum concurrent WebTransport sessions
    WebTransportMaxSessions = 0x14e9_cd29,
}

impl From<SettingId> for u64 {
    fn from(id: SettingId) -> Self {
        id as u64
    }
}

/// Identifiers carried over from HTTP/2 that must not appear in HTTP/3.
const RESERVED_H2_SETTINGS: [u64; 4] = [0x02, 0x03, 0x04, 0x05];

/// Check whether `id` is a reserved GREASE identifier (`0x1f * N + 0x21`).
pub fn is_grease(id: u64) -> bool {
    id >= 0x21 && (id - 0x21) % 0x1f == 0
}

/// An ordered set of SETTINGS entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(u64, u64)>,
}

impl Settings {
    /// Create an empty settings set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `id` to `value`, replacing any previous value.
    pub fn insert(&mut self, id: impl Into<u64>, value: u64) {
        let id = id.into();
        match self.entries.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((id, value)),
        }
    }

    /// Look up the value for `id`.
    pub fn get(&self, id: impl Into<u64>) -> Option<u64> {
        let id = id.into();
        self.entries.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the peer accepts Extended CONNECT.
    pub fn enable_connect_protocol(&self) -> bool {
        self.get(SettingId::EnableConnectProtocol) == Some(1)
    }

    /// Peer's limit on concurrent WebTransport sessions, zero when absent.
    pub fn webtransport_max_sessions(&self) -> u64 {
        self.get(SettingId::WebTransportMaxSessions).unwrap_or(0)
    }

    pub fn qpack_max_table_capacity(&self) -> u64 {
        self.get(SettingId::QpackMaxTableCapacity).unwrap_or(0)
    }

    pub fn qpack_blocked_streams(&self) -> u64 {
        self.get(SettingId::QpackBlockedStreams).unwrap_or(0)
    }

    pub fn max_field_section_size(&self) -> Option<u64> {
        self.get(SettingId::MaxFieldSectionSize)
    }

    /// Encode the payload of a SETTINGS frame.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), ParseError> {
        for (id, value) in &self.entries {
            varint::encode(*id, buf)?;
            varint::encode(*value, buf)?;
        }
        Ok(())
    }

    /// Byte length of the encoded payload.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(id, value)| varint::encoded_len(*id) + varint::encoded_len(*value))
            .sum()
    }

    /// Decode the payload of a SETTINGS frame.
    ///
    /// Duplicate identifiers, HTTP/2-only identifiers and boolean settings
    /// with values other than 0 or 1 are connection errors.
    pub fn decode(mut payload: &[u8]) -> H3Result<Self> {
        let mut settings = Settings::new();
        while payload.has_remaining() {
            let id = varint::decode(&mut payload)
                .map_err(|_| ConnectionError::Settings("truncated identifier".into()))?;
            let value = varint::decode(&mut payload)
                .map_err(|_| ConnectionError::Settings(format!("truncated value for {id:#x}")))?;

            if RESERVED_H2_SETTINGS.contains(&id) {
                return Err(ConnectionError::Settings(format!("HTTP/2 setting {id:#x}")).into());
            }
            if settings.get(id).is_some() {
                return Err(ConnectionError::Settings(format!("duplicate setting {id:#x}")).into());
            }
            let boolean = id == u64::from(SettingId::EnableConnectProtocol)
                || id == u64::from(SettingId::H3Datagram);
            if boolean && value > 1 {
                return Err(ConnectionError::Settings(format!(
                    "setting {id:#x} must be 0 or 1, got {value}"
                ))
                .into());
            }
            settings.entries.push((id, value));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::H3Error;
    use bytes::BytesMut;

    #[test]
    fn test_order_is_preserved() {
        let mut settings = Settings::new();
        settings.insert(SettingId::EnableConnectProtocol, 1);
        settings.insert(SettingId::QpackMaxTableCapacity, 0);
        settings.insert(0x1234u64, 9);
        settings.insert(SettingId::EnableConnectProtocol, 0);

        let ids: Vec<u64> = settings.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0x08, 0x01, 0x1234]);
        assert_eq!(settings.get(SettingId::EnableConnectProtocol), Some(0));
    }

    #[test]
    fn test_encode_decode() {
        let mut settings = Settings::new();
        settings.insert(SettingId::EnableConnectProtocol, 1);
        settings.insert(SettingId::WebTransportMaxSessions, 4);

        let mut buf = BytesMut::new();
        settings.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), settings.encoded_len());

        let decoded = Settings::decode(&buf).unwrap();
        assert!(decoded.enable_connect_protocol());
        assert_eq!(decoded.webtransport_max_sessions(), 4);
    }

    #[test]
    fn test_duplicate_setting_rejected() {
        let payload = [0x08, 0x01, 0x08, 0x01];
        let err = Settings::decode(&payload).unwrap_err();
        assert!(matches!(err, H3Error::Connection(ConnectionError::Settings(_))));
        assert_eq!(err.error_code(), crate::error::codes::H3_SETTINGS_ERROR);
    }

    #[test]
    fn test_invalid_boolean_and_h2_settings() {
        assert!(Settings::decode(&[0x08, 0x02]).is_err());
        assert!(Settings::decode(&[0x04, 0x00]).is_err());
        assert!(Settings::decode(&[0x08]).is_err());
    }

    #[test]
    fn test_grease_ids() {
        assert!(is_grease(0x21));
        assert!(is_grease(0x21 + 0x1f * 7));
        assert!(!is_grease(0x08));
        assert!(!is_grease(0x22));
    }
}
