//! Literal/match token stream.
//!
//! The delta stream for one file is a sequence of 4-byte tokens: a positive
//! value announces that many literal bytes, a negative value `-(i + 1)`
//! tells the receiver to copy block `i` from its basis file, and zero ends
//! the file. Literal runs never exceed [`CHUNK_SIZE`].

use std::io::{Read, Write};

use protocol::varint::{read_int, write_int};

use crate::error::EngineError;

/// Upper bound on one literal run.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// One decoded token.
#[derive(Debug, PartialEq, Eq)]
pub enum Token {
    /// Literal bytes to append to the rebuilt file.
    Literal(Vec<u8>),
    /// Copy basis block `0-based index` to the rebuilt file.
    Match(u32),
    /// End of this file's stream.
    Eof,
}

/// Emits a literal run, splitting it into bounded chunks.
pub fn write_literal<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), EngineError> {
    for chunk in data.chunks(CHUNK_SIZE) {
        write_int(writer, chunk.len() as i32).map_err(protocol::ProtocolError::from)?;
        writer
            .write_all(chunk)
            .map_err(protocol::ProtocolError::from)?;
    }
    Ok(())
}

/// Emits a block-match token.
pub fn write_match<W: Write>(writer: &mut W, block_index: u32) -> Result<(), EngineError> {
    write_int(writer, -(block_index as i32) - 1).map_err(protocol::ProtocolError::from)?;
    Ok(())
}

/// Ends the file's token stream.
pub fn write_eof<W: Write>(writer: &mut W) -> Result<(), EngineError> {
    write_int(writer, 0).map_err(protocol::ProtocolError::from)?;
    Ok(())
}

/// Reads the next token.
pub fn read_token<R: Read>(reader: &mut R) -> Result<Token, EngineError> {
    let value = read_int(reader)?;
    if value == 0 {
        return Ok(Token::Eof);
    }
    if value > 0 {
        let len = value as usize;
        if len > CHUNK_SIZE {
            return Err(EngineError::Sequence("literal run exceeds the chunk bound"));
        }
        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .map_err(protocol::ProtocolError::from)?;
        return Ok(Token::Literal(data));
    }
    Ok(Token::Match((-(value + 1)) as u32))
}
