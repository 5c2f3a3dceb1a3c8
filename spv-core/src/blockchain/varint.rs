//! Bitcoin CompactSize ("varint") codec
//!
//! Writers always emit the canonical minimal form. Readers accept
//! non-canonical encodings, matching what the network tolerates.

use std::fmt;

const VAR_INT16_HEADER: u8 = 0xfd;
const VAR_INT32_HEADER: u8 = 0xfe;
const VAR_INT64_HEADER: u8 = 0xff;

/// Error type for varint decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarIntError {
    /// Input ended before the encoded value was complete
    UnexpectedEnd,
}

impl fmt::Display for VarIntError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarIntError::UnexpectedEnd => write!(f, "Unexpected end of varint input"),
        }
    }
}

impl std::error::Error for VarIntError {}

/// Number of bytes `value` occupies in canonical encoding
pub fn varint_size(value: u64) -> usize {
    if value < VAR_INT16_HEADER as u64 {
        1
    } else if value <= u16::MAX as u64 {
        3
    } else if value <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Append the canonical encoding of `value` to `buf`
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    if value < VAR_INT16_HEADER as u64 {
        buf.push(value as u8);
    } else if value <= u16::MAX as u64 {
        buf.push(VAR_INT16_HEADER);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= u32::MAX as u64 {
        buf.push(VAR_INT32_HEADER);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(VAR_INT64_HEADER);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Decode a varint from the start of `bytes`, returning the value and the
/// number of bytes consumed
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize), VarIntError> {
    let header = *bytes.first().ok_or(VarIntError::UnexpectedEnd)?;

    match header {
        VAR_INT16_HEADER => {
            if bytes.len() < 3 {
                return Err(VarIntError::UnexpectedEnd);
            }
            Ok((u16::from_le_bytes([bytes[1], bytes[2]]) as u64, 3))
        }
        VAR_INT32_HEADER => {
            if bytes.len() < 5 {
                return Err(VarIntError::UnexpectedEnd);
            }
            Ok((
                u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as u64,
                5,
            ))
        }
        VAR_INT64_HEADER => {
            if bytes.len() < 9 {
                return Err(VarIntError::UnexpectedEnd);
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[1..9]);
            Ok((u64::from_le_bytes(b), 9))
        }
        _ => Ok((header as u64, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_boundary_encodings() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x10000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];

        for &(value, size) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), size, "encoding size for {:#x}", value);
            assert_eq!(varint_size(value), size);
            assert_eq!(read_varint(&buf).unwrap(), (value, size));
        }
    }

    #[test]
    fn test_accepts_non_canonical_input() {
        // 5 encoded wastefully as a u16
        let bytes = [VAR_INT16_HEADER, 5, 0];
        assert_eq!(read_varint(&bytes).unwrap(), (5, 3));

        // and as a u64
        let bytes = [VAR_INT64_HEADER, 5, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(read_varint(&bytes).unwrap(), (5, 9));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(read_varint(&[]), Err(VarIntError::UnexpectedEnd));
        assert_eq!(read_varint(&[VAR_INT16_HEADER, 1]), Err(VarIntError::UnexpectedEnd));
        assert_eq!(
            read_varint(&[VAR_INT32_HEADER, 1, 2, 3]),
            Err(VarIntError::UnexpectedEnd)
        );
        assert_eq!(
            read_varint(&[VAR_INT64_HEADER, 1, 2, 3, 4, 5, 6, 7]),
            Err(VarIntError::UnexpectedEnd)
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_identity_and_minimal(value in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let (decoded, consumed) = read_varint(&buf).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buf.len());
            prop_assert_eq!(buf.len(), varint_size(value));
        }
    }
}
