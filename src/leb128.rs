//! ULEB128/SLEB128 codecs used by the bind, rebase, and export-trie
//! opcode streams.

use crate::error::{ExtractError, Result};

/// Decode an unsigned LEB128 value, returning it along with the new
/// read head.
pub fn decode_uleb128(buffer: &[u8], mut read_head: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = *buffer
            .get(read_head)
            .ok_or_else(|| ExtractError::ChainCorrupt("uleb extends beyond buffer".into()))?;

        value |= u64::from(byte & 0x7f) << shift;

        read_head += 1;
        shift += 7;

        if byte & 0x80 == 0 {
            break;
        }
    }

    Ok((value, read_head))
}

/// Decode a 64-bit signed LEB128 value, returning it along with the new
/// read head.
pub fn decode_sleb128(buffer: &[u8], mut read_head: usize) -> Result<(i64, usize)> {
    const RESULT_SIZE: u32 = 64;

    let mut result = 0i64;
    let mut shift = 0u32;

    loop {
        let byte = *buffer
            .get(read_head)
            .ok_or_else(|| ExtractError::ChainCorrupt("sleb extends beyond buffer".into()))?;

        result |= i64::from(byte & 0x7f) << shift;

        read_head += 1;
        shift += 7;

        if byte & 0x80 == 0 {
            if shift < RESULT_SIZE && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            break;
        }
    }

    Ok((result, read_head))
}

/// Encode the given value as unsigned LEB128.
pub fn encode_uleb128(mut value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }

    let mut data = Vec::new();
    while value != 0 {
        let mut current = (value & 0x7f) as u8;
        value >>= 7;

        if value != 0 {
            current |= 0x80;
        }
        data.push(current);
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb_round_trip() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x0123_4567_89ab_cdef] {
            let encoded = encode_uleb128(value);
            let (decoded, head) = decode_uleb128(&encoded, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(head, encoded.len());
        }
    }

    #[test]
    fn uleb_multibyte_layout() {
        assert_eq!(encode_uleb128(624_485), vec![0xe5, 0x8e, 0x26]);
        let (value, _) = decode_uleb128(&[0xe5, 0x8e, 0x26], 0).unwrap();
        assert_eq!(value, 624_485);
    }

    #[test]
    fn sleb_negative() {
        // -123456 encoded per the DWARF spec example
        let (value, head) = decode_sleb128(&[0xc0, 0xbb, 0x78], 0).unwrap();
        assert_eq!(value, -123_456);
        assert_eq!(head, 3);
    }

    #[test]
    fn uleb_truncated_is_an_error() {
        assert!(decode_uleb128(&[0x80], 0).is_err());
    }
}
