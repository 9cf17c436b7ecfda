//! Header compression seam.
//!
//! The connection only needs `compress`/`decompress` of whole field
//! sections. [`StaticQpack`] is a QPACK codec that never uses the dynamic
//! table (so it needs no encoder/decoder streams) and never Huffman-encodes.
//! Any other implementation can be plugged in through [`HeaderCodec`].

use crate::error::{H3Result, ProtocolError};
use crate::protocol::headers::HeaderField;
use bytes::Bytes;

/// Compresses and decompresses HEADERS frame payloads.
pub trait HeaderCodec: Send + Sync + 'static {
    /// Encode an ordered list of fields into a field section.
    fn compress(&self, fields: &[HeaderField]) -> H3Result<Bytes>;

    /// Decode a field section into its ordered list of fields.
    fn decompress(&self, block: &[u8]) -> H3Result<Vec<HeaderField>>;
}

/// QPACK restricted to the static table and literal field lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticQpack;

impl HeaderCodec for StaticQpack {
    fn compress(&self, fields: &[HeaderField]) -> H3Result<Bytes> {
        let mut buf = Vec::with_capacity(2 + fields.len() * 16);
        // Required Insert Count = 0, Delta Base = 0.
        buf.push(0x00);
        buf.push(0x00);

        for field in fields {
            let (name, value) = (field.name.as_str(), field.value.as_str());
            if let Some(index) = static_exact(name, value) {
                // Indexed field line, static table: 11xxxxxx
                encode_prefix_int(&mut buf, index as u64, 6, 0xc0);
            } else if let Some(index) = static_name(name) {
                // Literal with static name reference: 01N1xxxx
                encode_prefix_int(&mut buf, index as u64, 4, 0x50);
                encode_string(&mut buf, value.as_bytes(), 7, 0x00);
            } else {
                // Literal with literal name: 001NHxxx
                encode_string(&mut buf, name.as_bytes(), 3, 0x20);
                encode_string(&mut buf, value.as_bytes(), 7, 0x00);
            }
        }
        Ok(Bytes::from(buf))
    }

    fn decompress(&self, block: &[u8]) -> H3Result<Vec<HeaderField>> {
        let (required_insert_count, n) = decode_prefix_int(block, 8)?;
        if required_insert_count != 0 {
            return Err(qpack_error("dynamic table references are not supported"));
        }
        let (_delta_base, m) = decode_prefix_int(&block[n..], 7)?;
        let mut pos = n + m;

        let mut fields = Vec::new();
        while pos < block.len() {
            let first = block[pos];
            let rest = &block[pos..];
            if first & 0x80 != 0 {
                if first & 0x40 == 0 {
                    return Err(qpack_error("dynamic table references are not supported"));
                }
                let (index, used) = decode_prefix_int(rest, 6)?;
                let (name, value) = static_entry(index)?;
                fields.push(HeaderField::new(name, value));
                pos += used;
            } else if first & 0x40 != 0 {
                if first & 0x10 == 0 {
                    return Err(qpack_error("dynamic table references are not supported"));
                }
                let (index, used) = decode_prefix_int(rest, 4)?;
                let (name, _) = static_entry(index)?;
                let (value, value_len) = decode_string(&rest[used..], 7)?;
                fields.push(HeaderField::new(name, value));
                pos += used + value_len;
            } else if first & 0x20 != 0 {
                let (name, name_len) = decode_string(rest, 3)?;
                let (value, value_len) = decode_string(&rest[name_len..], 7)?;
                fields.push(HeaderField::new(name, value));
                pos += name_len + value_len;
            } else {
                return Err(qpack_error("post-base field lines are not supported"));
            }
        }
        Ok(fields)
    }
}

fn qpack_error(msg: &str) -> crate::error::H3Error {
    ProtocolError::Qpack(msg.to_string()).into()
}

fn static_exact(name: &str, value: &str) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| *n == name && *v == value)
}

fn static_name(name: &str) -> Option<usize> {
    STATIC_TABLE.iter().position(|(n, _)| *n == name)
}

fn static_entry(index: u64) -> H3Result<(&'static str, &'static str)> {
    usize::try_from(index)
        .ok()
        .and_then(|i| STATIC_TABLE.get(i).copied())
        .ok_or_else(|| qpack_error("static table index out of range"))
}

fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, first_byte_mask: u8) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        buf.push(first_byte_mask | value as u8);
        return;
    }
    buf.push(first_byte_mask | max_prefix as u8);
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        buf.push(0x80 | (remaining & 0x7f) as u8);
        remaining >>= 7;
    }
    buf.push(remaining as u8);
}

/// String literal without Huffman coding; the H bit sits just above the prefix.
fn encode_string(buf: &mut Vec<u8>, data: &[u8], prefix_bits: u8, first_byte_mask: u8) {
    encode_prefix_int(buf, data.len() as u64, prefix_bits, first_byte_mask);
    buf.extend_from_slice(data);
}

fn decode_prefix_int(data: &[u8], prefix_bits: u8) -> H3Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| qpack_error("unexpected end of prefix integer"))?;
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = u64::from(first) & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }

    let mut offset = 1;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(offset)
            .ok_or_else(|| qpack_error("truncated prefix integer"))?;
        offset += 1;
        value = value
            .checked_add(u64::from(byte & 0x7f) << shift)
            .ok_or_else(|| qpack_error("prefix integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok((value, offset));
        }
        shift += 7;
        if shift > 56 {
            return Err(qpack_error("prefix integer overflow"));
        }
    }
}

fn decode_string(data: &[u8], prefix_bits: u8) -> H3Result<(String, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| qpack_error("unexpected end of string"))?;
    if first & (1 << prefix_bits) != 0 {
        return Err(qpack_error("Huffman-coded strings are not supported"));
    }
    let (length, n) = decode_prefix_int(data, prefix_bits)?;
    let end = usize::try_from(length)
        .ok()
        .and_then(|len| n.checked_add(len))
        .filter(|end| *end <= data.len())
        .ok_or_else(|| qpack_error("truncated string"))?;
    let text = std::str::from_utf8(&data[n..end])
        .map_err(|_| qpack_error("invalid UTF-8 in string"))?;
    Ok((text.to_string(), end))
}

/// RFC 9204 Appendix A.
static STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name, value)
    }

    #[test]
    fn test_connect_section_round_trip() {
        let fields = vec![
            field(":method", "CONNECT"),
            field(":protocol", "webtransport"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/wt"),
            field("User-Agent", "JUnit-Test"),
            field("x-long", &"v".repeat(300)),
        ];
        let codec = StaticQpack;
        let block = codec.compress(&fields).unwrap();
        assert_eq!(codec.decompress(&block).unwrap(), fields);
    }

    #[test]
    fn test_static_indexed_line() {
        // :method CONNECT is static index 15: 11 001111
        let fields = StaticQpack.decompress(&[0x00, 0x00, 0xcf]).unwrap();
        assert_eq!(fields, vec![field(":method", "CONNECT")]);
        assert_eq!(
            StaticQpack.compress(&fields).unwrap().as_ref(),
            &[0x00, 0x00, 0xcf]
        );
    }

    #[test]
    fn test_static_name_reference() {
        let fields = vec![field(":path", "/headers")];
        let block = StaticQpack.compress(&fields).unwrap();
        // 0101 0001 = name ref to index 1 (:path), then length 8.
        assert_eq!(&block[..4], &[0x00, 0x00, 0x51, 0x08]);
        assert_eq!(StaticQpack.decompress(&block).unwrap(), fields);
    }

    #[test]
    fn test_unsupported_representations() {
        // Required insert count != 0
        assert!(StaticQpack.decompress(&[0x01, 0x00]).is_err());
        // Indexed line referencing the dynamic table (T = 0)
        assert!(StaticQpack.decompress(&[0x00, 0x00, 0x81]).is_err());
        // Huffman-coded literal value
        assert!(StaticQpack.decompress(&[0x00, 0x00, 0x51, 0x81, 0xff]).is_err());
        // Truncated literal
        assert!(StaticQpack.decompress(&[0x00, 0x00, 0x51, 0x05, b'a']).is_err());
    }

    #[test]
    fn test_prefix_int_boundaries() {
        for value in [0u64, 1, 14, 15, 16, 127, 128, 1000, 65535] {
            let mut buf = Vec::new();
            encode_prefix_int(&mut buf, value, 4, 0x50);
            let (decoded, used) = decode_prefix_int(&buf, 4).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }
}
