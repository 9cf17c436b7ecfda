//! QUIC variable-length integer codec (RFC 9000 section 16).
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or 8
//! byte encoding. Decoding accepts any of the four lengths for a value;
//! encoding always picks the shortest.

use crate::error::ParseError;
use bytes::{Buf, BufMut};

/// Largest value representable as a varint (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes needed to encode `value`.
pub fn encoded_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Length of a varint given its first byte.
pub fn len_from_first_byte(first: u8) -> usize {
    1 << (first >> 6)
}

/// Encode `value` into `buf` using the minimal form.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) -> Result<(), ParseError> {
    if value > MAX_VARINT {
        return Err(ParseError::VarIntOverflow(value));
    }
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Decode a varint from the front of `buf`, advancing past it.
///
/// Fails with [`ParseError::Incomplete`] when `buf` holds fewer bytes than the
/// first byte announces; in that case `buf` is left untouched.
pub fn decode<B: Buf>(buf: &mut B) -> Result<u64, ParseError> {
    if !buf.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    let len = len_from_first_byte(buf.chunk()[0]);
    if buf.remaining() < len {
        return Err(ParseError::Incomplete);
    }
    let value = match len {
        1 => u64::from(buf.get_u8() & 0x3f),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
    };
    Ok(value)
}

/// Decode a varint from a slice without consuming it.
///
/// Returns the value and the number of bytes it occupies, or `None` if the
/// slice is too short.
pub fn peek(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = len_from_first_byte(first);
    if data.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for &b in &data[1..len] {
        value = (value << 8) | u64::from(b);
    }
    Some((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode_to_vec(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(value, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_boundaries_round_trip() {
        let values = [
            0,
            1,
            63,
            64,
            16383,
            16384,
            (1 << 30) - 1,
            1 << 30,
            MAX_VARINT - 1,
            MAX_VARINT,
        ];
        for value in values {
            let bytes = encode_to_vec(value);
            assert_eq!(bytes.len(), encoded_len(value), "length for {value}");
            let mut slice = &bytes[..];
            assert_eq!(decode(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_round_trip_sampled_range() {
        // Walk the full 62-bit range with a multiplicative step so every
        // encoded length is hit many times.
        let mut value = 1u64;
        while value <= MAX_VARINT {
            let bytes = encode_to_vec(value);
            assert_eq!(decode(&mut &bytes[..]).unwrap(), value);
            assert_eq!(peek(&bytes), Some((value, bytes.len())));
            value = value * 3 + 7;
        }
    }

    #[test]
    fn test_rfc_examples() {
        assert_eq!(
            decode(&mut &[0xc2u8, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..]).unwrap(),
            151_288_809_941_952_652
        );
        assert_eq!(decode(&mut &[0x9du8, 0x7f, 0x3e, 0x7d][..]).unwrap(), 494_878_333);
        assert_eq!(decode(&mut &[0x7bu8, 0xbd][..]).unwrap(), 15_293);
        assert_eq!(decode(&mut &[0x25u8][..]).unwrap(), 37);
        assert_eq!(encode_to_vec(0x41), vec![0x40, 0x41]);
        assert_eq!(encode_to_vec(0x54), vec![0x40, 0x54]);
    }

    #[test]
    fn test_non_minimal_encoding_accepted() {
        assert_eq!(decode(&mut &[0x40u8, 0x25][..]).unwrap(), 37);
        assert_eq!(peek(&[0x80, 0x00, 0x00, 0x25]), Some((37, 4)));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = &[0x80u8, 0x01][..];
        assert!(matches!(decode(&mut buf), Err(ParseError::Incomplete)));
        assert_eq!(buf.len(), 2);
        assert!(matches!(decode(&mut &[0u8; 0][..]), Err(ParseError::Incomplete)));
        assert_eq!(peek(&[0xc0, 0, 0]), None);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode(MAX_VARINT + 1, &mut buf),
            Err(ParseError::VarIntOverflow(_))
        ));
        assert!(buf.is_empty());
    }
}
