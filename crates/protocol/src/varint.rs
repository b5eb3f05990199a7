//! Fixed-width and variable-length integer codecs.
//!
//! All multi-byte integers on the rsync wire are little-endian. The
//! variable-length forms put a marker byte first: its high bits select how
//! many value bytes follow beyond the guaranteed minimum, and its remaining
//! low bits carry the slice of the value just above those bytes. The marker
//! classes mirror upstream rsync's `int_byte_extra` table, so a conforming
//! peer decodes these encodings byte-for-byte.

use std::io::{self, Read, Write};

use crate::error::ProtocolError;

/// Additional value bytes implied by each group of four marker values.
///
/// Index with `marker >> 2`. Mirrors upstream rsync's `int_byte_extra`.
const INT_BYTE_EXTRA: [u8; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x00 - 0x3F
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 0x80 - 0xBF
    2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 5, 6, // 0xC0 - 0xFF
];

/// Marker tag for each extra-byte class.
const MARKER_TAG: [u8; 7] = [0x00, 0x80, 0xC0, 0xE0, 0xF0, 0xF8, 0xFC];

/// Bits of the value the marker itself can carry per extra-byte class.
const MARKER_FREE_BITS: [u32; 7] = [7, 6, 5, 4, 3, 2, 2];

/// Mask isolating the value bits of a marker per extra-byte class.
const MARKER_VALUE_MASK: [u8; 7] = [0x7F, 0x3F, 0x1F, 0x0F, 0x07, 0x03, 0x03];

/// Reads one byte.
pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, ProtocolError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Writes one byte.
pub fn write_u8<W: Write>(writer: &mut W, value: u8) -> io::Result<()> {
    writer.write_all(&[value])
}

/// Reads a fixed-width little-endian `i32`.
pub fn read_int<R: Read>(reader: &mut R) -> Result<i32, ProtocolError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

/// Writes a fixed-width little-endian `i32`.
pub fn write_int<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Writes a variable-length `i32`.
///
/// The 32-bit flavor has no guaranteed prefix: the marker is followed by
/// zero to four value bytes.
pub fn write_var_int<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    let unsigned = value as u32;
    let bits = 32 - unsigned.leading_zeros();

    let mut extra = 0usize;
    while 8 * extra as u32 + MARKER_FREE_BITS[extra] < bits {
        extra += 1;
    }

    let mut bytes = [0u8; 5];
    bytes[..4].copy_from_slice(&unsigned.to_le_bytes());
    let marker = MARKER_TAG[extra] | bytes[extra];

    writer.write_all(&[marker])?;
    writer.write_all(&bytes[..extra])
}

/// Reads a variable-length `i32` written by [`write_var_int`].
pub fn read_var_int<R: Read>(reader: &mut R) -> Result<i32, ProtocolError> {
    let marker = read_u8(reader)?;
    let extra = usize::from(INT_BYTE_EXTRA[usize::from(marker >> 2)]);
    if extra > 4 {
        return Err(ProtocolError::Varint("length overflows a 32-bit value"));
    }

    let mut bytes = [0u8; 5];
    reader.read_exact(&mut bytes[..extra])?;
    bytes[extra] = marker & MARKER_VALUE_MASK[extra];
    if bytes[4] != 0 {
        return Err(ProtocolError::Varint("value overflows 32 bits"));
    }

    let mut value = [0u8; 4];
    value.copy_from_slice(&bytes[..4]);
    Ok(i32::from_le_bytes(value))
}

/// Writes a variable-length `i64` that always occupies at least `min_bytes`
/// bytes on the wire.
///
/// Used for block sizes, file sizes, mtimes and session statistics. The
/// caller picks `min_bytes` per field (3 for sizes and statistics, 4 for
/// mtimes); both peers must agree on it out of band.
///
/// # Panics
///
/// Debug builds assert `3 <= min_bytes <= 9`; smaller prefixes cannot carry
/// the full 64-bit range.
pub fn write_var_long<W: Write>(writer: &mut W, value: i64, min_bytes: usize) -> io::Result<()> {
    debug_assert!((3..=9).contains(&min_bytes));

    let unsigned = value as u64;
    let bits = 64 - unsigned.leading_zeros();
    let prefix = min_bytes - 1;

    let mut extra = 0usize;
    while 8 * (prefix + extra) as u32 + MARKER_FREE_BITS[extra] < bits {
        extra += 1;
    }

    let mut bytes = [0u8; 9];
    bytes[..8].copy_from_slice(&unsigned.to_le_bytes());
    let count = prefix + extra;
    let marker = MARKER_TAG[extra] | bytes[count];

    writer.write_all(&[marker])?;
    writer.write_all(&bytes[..count])
}

/// Reads a variable-length `i64` written by [`write_var_long`] with the same
/// `min_bytes`.
pub fn read_var_long<R: Read>(reader: &mut R, min_bytes: usize) -> Result<i64, ProtocolError> {
    debug_assert!((3..=9).contains(&min_bytes));

    let marker = read_u8(reader)?;
    let extra = usize::from(INT_BYTE_EXTRA[usize::from(marker >> 2)]);
    let count = min_bytes - 1 + extra;
    if count > 8 {
        return Err(ProtocolError::Varint("length overflows a 64-bit value"));
    }

    let mut bytes = [0u8; 9];
    reader.read_exact(&mut bytes[..count])?;
    bytes[count] = marker & MARKER_VALUE_MASK[extra];
    if bytes[8] != 0 {
        return Err(ProtocolError::Varint("value overflows 64 bits"));
    }

    let mut value = [0u8; 8];
    value.copy_from_slice(&bytes[..8]);
    Ok(i64::from_le_bytes(value))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encode_long(value: i64, min_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        write_var_long(&mut out, value, min_bytes).expect("vec write");
        out
    }

    fn decode_long(bytes: &[u8], min_bytes: usize) -> i64 {
        let mut cursor = bytes;
        let value = read_var_long(&mut cursor, min_bytes).expect("decode succeeds");
        assert!(cursor.is_empty(), "trailing bytes after decode");
        value
    }

    #[test]
    fn var_long_matches_reference_vectors() {
        // Reference encodings with min_bytes = 3, bytes listed as signed
        // decimals the way the interop captures record them.
        let vectors: &[(i64, &[i8])] = &[
            (i64::MIN, &[-4, 0, 0, 0, 0, 0, 0, 0, -128]),
            (-1, &[-4, -1, -1, -1, -1, -1, -1, -1, -1]),
            (0, &[0, 0, 0]),
            (1, &[0, 1, 0]),
            (255, &[0, -1, 0]),
            (256, &[0, 0, 1]),
            (524_287, &[7, -1, -1]),
            (524_288, &[8, 0, 0]),
            (4_294_967_295, &[-64, -1, -1, -1, -1]),
            (i64::MAX, &[-4, -1, -1, -1, -1, -1, -1, -1, 127]),
        ];

        for &(value, expected) in vectors {
            let expected: Vec<u8> = expected.iter().map(|&b| b as u8).collect();
            assert_eq!(encode_long(value, 3), expected, "encoding of {value}");
            assert_eq!(decode_long(&expected, 3), value, "decoding of {value}");
        }
    }

    #[test]
    fn var_long_round_trips_boundary_values() {
        for &min_bytes in &[3usize, 5, 9] {
            for &value in &[
                i64::MIN,
                i64::MIN + 1,
                -4_294_967_296,
                -1,
                0,
                1,
                127,
                128,
                65_535,
                65_536,
                i64::from(i32::MAX),
                i64::MAX - 1,
                i64::MAX,
            ] {
                let encoded = encode_long(value, min_bytes);
                assert!(encoded.len() >= min_bytes);
                assert_eq!(decode_long(&encoded, min_bytes), value);
            }
        }
    }

    #[test]
    fn var_long_rejects_oversized_extra_count() {
        // A 0xFC marker with min_bytes = 5 would imply ten value bytes.
        let bytes = [0xFCu8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = &bytes[..];
        let err = read_var_long(&mut cursor, 5).expect_err("overlong framing must fail");
        assert!(matches!(err, ProtocolError::Varint(_)));
    }

    #[test]
    fn var_long_rejects_ninth_byte_overflow() {
        // Marker claims two spare bits above a full 8-byte value.
        let bytes = [0xFDu8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = &bytes[..];
        let err = read_var_long(&mut cursor, 3).expect_err("65-bit value must fail");
        assert!(matches!(err, ProtocolError::Varint(_)));
    }

    #[test]
    fn var_int_round_trips_boundary_values() {
        for &value in &[
            i32::MIN,
            -1,
            0,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            i32::MAX - 1,
            i32::MAX,
        ] {
            let mut encoded = Vec::new();
            write_var_int(&mut encoded, value).expect("vec write");
            let mut cursor = encoded.as_slice();
            assert_eq!(read_var_int(&mut cursor).expect("decode"), value);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn var_int_single_byte_for_small_values() {
        for value in 0..=0x7F {
            let mut encoded = Vec::new();
            write_var_int(&mut encoded, value).expect("vec write");
            assert_eq!(encoded, [value as u8]);
        }
    }

    #[test]
    fn fixed_int_is_little_endian() {
        let mut encoded = Vec::new();
        write_int(&mut encoded, 0x0403_0201).expect("vec write");
        assert_eq!(encoded, [1, 2, 3, 4]);
        assert_eq!(
            read_int(&mut encoded.as_slice()).expect("decode"),
            0x0403_0201
        );
    }

    proptest! {
        #[test]
        fn var_long_round_trips(value in any::<i64>(), min_sel in 0usize..3) {
            let min_bytes = [3, 5, 9][min_sel];
            let encoded = encode_long(value, min_bytes);
            prop_assert_eq!(decode_long(&encoded, min_bytes), value);
        }

        #[test]
        fn var_int_round_trips(value in any::<i32>()) {
            let mut encoded = Vec::new();
            write_var_int(&mut encoded, value).expect("vec write");
            let mut cursor = encoded.as_slice();
            prop_assert_eq!(read_var_int(&mut cursor).expect("decode"), value);
            prop_assert!(cursor.is_empty());
        }

        #[test]
        fn var_long_encoding_is_minimal(value in any::<i64>()) {
            // Re-encoding the decoded value must reproduce the same bytes;
            // the encoder never has two representations for one value.
            let encoded = encode_long(value, 3);
            let decoded = decode_long(&encoded, 3);
            prop_assert_eq!(encode_long(decoded, 3), encoded);
        }
    }
}
