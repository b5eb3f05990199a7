//! Block-checksum tables and the delta matcher.
//!
//! The generator splits the basis file into fixed blocks and ships a
//! (rolling, MD5-prefix) pair per block. The sender slides a window over
//! the source file, looking every position up in that table; confirmed
//! matches become block-match tokens, everything else literals. Block size
//! and digest length are deterministic functions of the file geometry so
//! both peers derive identical parameters from the sum head.

use std::io::{Read, Write};

use checksums::{FileDigest, MD5_SUM_LENGTH, RollingChecksum, block_digest, digest_len};
use rustc_hash::FxHashMap;

use protocol::varint::{read_int, write_int};

use crate::error::EngineError;
use crate::token;

/// Smallest dynamic block size.
pub const BLOCK_SIZE_MIN: u32 = 512;

/// Largest dynamic block size.
pub const BLOCK_SIZE_MAX: u32 = 1 << 17;

/// Sanity bound on the number of blocks in one sum table.
const MAX_BLOCK_COUNT: i32 = i32::MAX / 2;

/// Dynamic block size for a file of `len` bytes.
///
/// The integer square root of the length, forced even and clamped to
/// `[BLOCK_SIZE_MIN, BLOCK_SIZE_MAX]`. A deterministic function of the size
/// alone; both peers must agree on it.
#[must_use]
pub fn block_size(len: u64) -> u32 {
    let root = len.isqrt() & !1;
    root.clamp(u64::from(BLOCK_SIZE_MIN), u64::from(BLOCK_SIZE_MAX)) as u32
}

/// Geometry of one file's block-checksum table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumHead {
    /// Number of blocks.
    pub count: i32,
    /// Block length in bytes.
    pub block_len: i32,
    /// MD5 prefix length per block.
    pub digest_len: i32,
    /// Length of the final short block, zero when the size divides evenly.
    pub remainder: i32,
}

impl SumHead {
    /// Geometry for a basis file of `len` bytes.
    #[must_use]
    pub fn for_file(len: u64) -> Self {
        let block_len = u64::from(block_size(len));
        let count = len.div_ceil(block_len);
        Self {
            count: count as i32,
            block_len: block_len as i32,
            digest_len: digest_len(len, count) as i32,
            remainder: (len % block_len) as i32,
        }
    }

    /// The empty table: no basis, the whole file travels as literals.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            count: 0,
            block_len: BLOCK_SIZE_MIN as i32,
            digest_len: digest_len(0, 0) as i32,
            remainder: 0,
        }
    }

    /// Length of block `index`.
    #[must_use]
    pub fn block_len_at(&self, index: u32) -> usize {
        if self.remainder != 0 && index as i32 == self.count - 1 {
            self.remainder as usize
        } else {
            self.block_len as usize
        }
    }

    /// Writes the four-int head.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), EngineError> {
        write_int(writer, self.count).map_err(protocol::ProtocolError::from)?;
        write_int(writer, self.block_len).map_err(protocol::ProtocolError::from)?;
        write_int(writer, self.digest_len).map_err(protocol::ProtocolError::from)?;
        write_int(writer, self.remainder).map_err(protocol::ProtocolError::from)?;
        Ok(())
    }

    /// Reads and validates a four-int head.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, EngineError> {
        let count = read_int(reader)?;
        let block_len = read_int(reader)?;
        let digest_len = read_int(reader)?;
        let remainder = read_int(reader)?;

        if !(0..=MAX_BLOCK_COUNT).contains(&count) {
            return Err(EngineError::Sequence("sum head block count out of range"));
        }
        if !(BLOCK_SIZE_MIN as i32..=BLOCK_SIZE_MAX as i32).contains(&block_len) {
            return Err(EngineError::Sequence("sum head block length out of range"));
        }
        if !(1..=MD5_SUM_LENGTH as i32).contains(&digest_len) {
            return Err(EngineError::Sequence("sum head digest length out of range"));
        }
        if !(0..block_len).contains(&remainder) {
            return Err(EngineError::Sequence("sum head remainder out of range"));
        }

        Ok(Self {
            count,
            block_len,
            digest_len,
            remainder,
        })
    }
}

/// Generator-side table: one entry per basis block.
#[derive(Debug)]
pub struct SumTable {
    /// Table geometry.
    pub head: SumHead,
    /// `(rolling, truncated MD5)` per block, in file order.
    pub blocks: Vec<(u32, Vec<u8>)>,
}

impl SumTable {
    /// Computes the table over a basis file.
    pub fn compute<R: Read>(reader: &mut R, len: u64, seed: i32) -> Result<Self, EngineError> {
        let head = SumHead::for_file(len);
        let digest_len = head.digest_len as usize;
        let mut blocks = Vec::with_capacity(head.count as usize);

        let mut block = vec![0u8; head.block_len as usize];
        for index in 0..head.count as u32 {
            let want = head.block_len_at(index);
            read_fully(reader, &mut block[..want])?;

            let rolling = RollingChecksum::from_block(&block[..want]).value();
            let strong = block_digest(&block[..want], seed)[..digest_len].to_vec();
            blocks.push((rolling, strong));
        }

        Ok(Self { head, blocks })
    }

    /// Writes head plus per-block checksum pairs.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), EngineError> {
        self.head.write(writer)?;
        for (rolling, strong) in &self.blocks {
            write_int(writer, *rolling as i32).map_err(protocol::ProtocolError::from)?;
            writer
                .write_all(strong)
                .map_err(protocol::ProtocolError::from)?;
        }
        Ok(())
    }
}

/// Sender-side view of a sum table, indexed by rolling checksum.
#[derive(Debug)]
pub struct SumLookup {
    head: SumHead,
    by_rolling: FxHashMap<u32, Vec<(u32, Vec<u8>)>>,
}

impl SumLookup {
    /// Reads a table off the wire into lookup form.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, EngineError> {
        let head = SumHead::read(reader)?;
        let digest_len = head.digest_len as usize;

        let mut by_rolling: FxHashMap<u32, Vec<(u32, Vec<u8>)>> = FxHashMap::default();
        for index in 0..head.count as u32 {
            let rolling = read_int(reader)? as u32;
            let mut strong = vec![0u8; digest_len];
            reader
                .read_exact(&mut strong)
                .map_err(protocol::ProtocolError::from)?;
            by_rolling.entry(rolling).or_default().push((index, strong));
        }

        Ok(Self { head, by_rolling })
    }

    /// Table geometry.
    #[must_use]
    pub const fn head(&self) -> &SumHead {
        &self.head
    }

    /// True when the table has no blocks (everything becomes literal).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_rolling.is_empty()
    }

    /// Finds a basis block matching the window, confirming weak hits with
    /// the strong digest.
    #[must_use]
    pub fn find(&self, rolling: u32, window: &[u8], seed: i32) -> Option<u32> {
        let candidates = self.by_rolling.get(&rolling)?;
        let digest_len = self.head.digest_len as usize;
        let mut strong: Option<[u8; MD5_SUM_LENGTH]> = None;

        for (index, candidate) in candidates {
            if self.head.block_len_at(*index) != window.len() {
                continue;
            }
            let strong = strong.get_or_insert_with(|| block_digest(window, seed));
            if &strong[..digest_len] == candidate.as_slice() {
                return Some(*index);
            }
        }
        None
    }
}

/// Progress counters reported by the delta matcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaCounters {
    /// Bytes emitted as literals.
    pub literal: u64,
    /// Bytes covered by block matches.
    pub matched: u64,
}

/// Runs the sliding-window matcher over `source`, emitting the token
/// stream and returning the whole-file digest plus traffic counters.
pub fn generate_delta<R: Read, W: Write>(
    source: &mut R,
    lookup: &SumLookup,
    seed: i32,
    writer: &mut W,
) -> Result<([u8; MD5_SUM_LENGTH], DeltaCounters), EngineError> {
    if lookup.is_empty() {
        return stream_literals(source, seed, writer);
    }

    let block_len = lookup.head().block_len as usize;
    let mut window = SourceWindow::new(source, block_len.max(token::CHUNK_SIZE));
    let mut counters = DeltaCounters::default();
    let mut file_digest = FileDigest::new();
    let mut pending = Vec::with_capacity(token::CHUNK_SIZE);
    let mut rolling = RollingChecksum::new();
    let mut window_len = 0usize;

    loop {
        let available = window.fill(block_len)?;
        if available == 0 {
            break;
        }

        let target = available.min(block_len);
        if window_len != target {
            // (Re)prime the checksum after a match or at the shrinking tail.
            rolling = RollingChecksum::from_block(&window.buf()[..target]);
            window_len = target;
        }

        let matched = lookup.find(rolling.value(), &window.buf()[..window_len], seed);

        if let Some(index) = matched {
            flush_literals(&mut pending, writer, &mut counters)?;
            token::write_match(writer, index)?;
            counters.matched += window_len as u64;
            file_digest.update(&window.buf()[..window_len]);
            window.consume(window_len);
            window_len = 0;
        } else {
            let byte = window.buf()[0];
            pending.push(byte);
            file_digest.update(&[byte]);
            if pending.len() >= token::CHUNK_SIZE {
                flush_literals(&mut pending, writer, &mut counters)?;
            }

            // Slide one byte; the window shrinks once the file tail is in.
            let next = window.buf().get(window_len).copied();
            window.consume(1);
            match next {
                Some(incoming) => {
                    rolling
                        .roll(byte, incoming)
                        .map_err(|_| EngineError::Sequence("empty rolling window"))?;
                }
                None => {
                    rolling
                        .trim_front(byte)
                        .map_err(|_| EngineError::Sequence("empty rolling window"))?;
                    window_len -= 1;
                }
            }
        }
    }

    flush_literals(&mut pending, writer, &mut counters)?;
    token::write_eof(writer)?;
    Ok((file_digest.finish(seed), counters))
}

/// No-basis fast path: the whole source travels as bounded literal runs.
fn stream_literals<R: Read, W: Write>(
    source: &mut R,
    seed: i32,
    writer: &mut W,
) -> Result<([u8; MD5_SUM_LENGTH], DeltaCounters), EngineError> {
    let mut counters = DeltaCounters::default();
    let mut file_digest = FileDigest::new();
    let mut chunk = vec![0u8; token::CHUNK_SIZE];

    loop {
        let read = read_some(source, &mut chunk)?;
        if read == 0 {
            break;
        }
        token::write_literal(writer, &chunk[..read])?;
        file_digest.update(&chunk[..read]);
        counters.literal += read as u64;
    }

    token::write_eof(writer)?;
    Ok((file_digest.finish(seed), counters))
}

fn flush_literals<W: Write>(
    pending: &mut Vec<u8>,
    writer: &mut W,
    counters: &mut DeltaCounters,
) -> Result<(), EngineError> {
    if pending.is_empty() {
        return Ok(());
    }
    token::write_literal(writer, pending)?;
    counters.literal += pending.len() as u64;
    pending.clear();
    Ok(())
}

/// Forward-only buffered view over the source file.
///
/// Consumed bytes advance a start cursor; the buffer compacts once a whole
/// chunk has been consumed, keeping the per-byte slide amortized O(1).
struct SourceWindow<'a, R: Read> {
    reader: &'a mut R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
    chunk: usize,
}

impl<'a, R: Read> SourceWindow<'a, R> {
    fn new(reader: &'a mut R, chunk: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(chunk * 2),
            start: 0,
            eof: false,
            chunk,
        }
    }

    /// Ensures at least `want + 1` buffered bytes unless the file ends
    /// first; returns the bytes available.
    fn fill(&mut self, want: usize) -> Result<usize, EngineError> {
        if self.start >= self.chunk {
            self.buf.drain(..self.start);
            self.start = 0;
        }

        while self.buf.len() - self.start < want + 1 && !self.eof {
            let end = self.buf.len();
            self.buf.resize(end + self.chunk, 0);
            let read = read_some(self.reader, &mut self.buf[end..])?;
            self.buf.truncate(end + read);
            if read == 0 {
                self.eof = true;
            }
        }
        Ok(self.buf.len() - self.start)
    }

    fn buf(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.buf.len());
        self.start += n;
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), EngineError> {
    reader
        .read_exact(buf)
        .map_err(protocol::ProtocolError::from)?;
    Ok(())
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, EngineError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(protocol::ProtocolError::from(err).into()),
        }
    }
}
