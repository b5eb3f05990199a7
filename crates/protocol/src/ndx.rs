//! File-index delta codec.
//!
//! Protocol 30 transmits file indices as differences from the previous
//! index of the same sign, with separate positive and negative runs. The
//! encoder and decoder each keep that two-sided history, so the two ends of
//! a connection need one codec instance per direction.

use std::io::{Read, Write};

use crate::error::ProtocolError;
use crate::varint::read_u8;

/// End-of-phase sentinel, encoded as a single zero byte.
pub const NDX_DONE: i32 = -1;

/// The sender has no further file-list segments to transmit.
pub const NDX_FLIST_EOF: i32 = -2;

/// Base offset for incremental-recursion segment announcements: a directory
/// with index `n` is announced as `NDX_FLIST_OFFSET - n`.
pub const NDX_FLIST_OFFSET: i32 = -101;

/// Encoder half of the file-index codec.
#[derive(Debug)]
pub struct NdxWriter {
    prev_positive: i32,
    prev_negative: i32,
}

impl Default for NdxWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl NdxWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prev_positive: -1,
            prev_negative: 1,
        }
    }

    /// Encodes `ndx` relative to the previous index of the same sign.
    pub fn write_ndx<W: Write>(&mut self, writer: &mut W, ndx: i32) -> Result<(), ProtocolError> {
        let mut bytes = [0u8; 6];
        let mut len = 0usize;

        let (diff, abs) = if ndx >= 0 {
            let diff = ndx - self.prev_positive;
            self.prev_positive = ndx;
            (diff, ndx)
        } else if ndx == NDX_DONE {
            writer.write_all(&[0])?;
            return Ok(());
        } else {
            bytes[len] = 0xFF;
            len += 1;
            let abs = -ndx;
            let diff = abs - self.prev_negative;
            self.prev_negative = abs;
            (diff, abs)
        };

        if diff > 0 && diff < 0xFE {
            bytes[len] = diff as u8;
            len += 1;
        } else if diff < 0 || diff > 0x7FFF {
            // Out-of-range delta: fall back to the absolute index, flagged
            // by the high bit of its top byte.
            bytes[len] = 0xFE;
            bytes[len + 1] = ((abs >> 24) as u8) | 0x80;
            bytes[len + 2] = abs as u8;
            bytes[len + 3] = (abs >> 8) as u8;
            bytes[len + 4] = (abs >> 16) as u8;
            len += 5;
        } else {
            bytes[len] = 0xFE;
            bytes[len + 1] = (diff >> 8) as u8;
            bytes[len + 2] = diff as u8;
            len += 3;
        }

        writer.write_all(&bytes[..len])?;
        Ok(())
    }
}

/// Decoder half of the file-index codec.
#[derive(Debug)]
pub struct NdxReader {
    prev_positive: i32,
    prev_negative: i32,
}

impl Default for NdxReader {
    fn default() -> Self {
        Self::new()
    }
}

impl NdxReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prev_positive: -1,
            prev_negative: 1,
        }
    }

    /// Decodes the next file index off the wire.
    pub fn read_ndx<R: Read>(&mut self, reader: &mut R) -> Result<i32, ProtocolError> {
        let first = read_u8(reader)?;

        let (negative, lead) = if first == 0 {
            return Ok(NDX_DONE);
        } else if first == 0xFF {
            (true, read_u8(reader)?)
        } else {
            (false, first)
        };

        let prev = if negative {
            &mut self.prev_negative
        } else {
            &mut self.prev_positive
        };

        let num = if lead == 0xFE {
            let mut pair = [0u8; 2];
            reader.read_exact(&mut pair)?;
            if pair[0] & 0x80 != 0 {
                let mut rest = [0u8; 2];
                reader.read_exact(&mut rest)?;
                i32::from(pair[1])
                    | (i32::from(rest[0]) << 8)
                    | (i32::from(rest[1]) << 16)
                    | (i32::from(pair[0] & 0x7F) << 24)
            } else {
                ((i32::from(pair[0]) << 8) | i32::from(pair[1])) + *prev
            }
        } else {
            i32::from(lead) + *prev
        };

        if num < 0 || (negative && num == 0) {
            return Err(ProtocolError::Ndx("index ran outside its sign run"));
        }
        *prev = num;

        Ok(if negative { -num } else { num })
    }
}
