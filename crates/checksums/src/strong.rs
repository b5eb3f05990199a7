//! Seeded MD5 strong digests.
//!
//! Block digests and the whole-file digest both fold the session's 4-byte
//! little-endian checksum seed in after the data, so digests from different
//! sessions never collide by construction. The generator truncates block
//! digests to a length derived from the file geometry; the full 16 bytes
//! travel only with the whole-file digest.

use digest::Digest;
use md5::Md5;

/// Full MD5 digest length in bytes.
pub const MD5_SUM_LENGTH: usize = 16;

/// Smallest block-digest prefix a sum head may advertise.
pub const MIN_DIGEST_LENGTH: usize = 2;

/// Largest block-digest prefix (the full MD5).
pub const MAX_DIGEST_LENGTH: usize = MD5_SUM_LENGTH;

/// Bias applied before sizing block digests, in bits.
const BLOCKSUM_BIAS: u32 = 10;

/// MD5 over (block bytes ∥ seed).
#[must_use]
pub fn block_digest(block: &[u8], seed: i32) -> [u8; MD5_SUM_LENGTH] {
    let mut md5 = Md5::new();
    md5.update(block);
    md5.update(seed.to_le_bytes());
    md5.finalize().into()
}

/// Incremental MD5 over a whole file, seed folded in at the end.
#[derive(Clone)]
pub struct FileDigest {
    md5: Md5,
}

impl FileDigest {
    #[must_use]
    pub fn new() -> Self {
        Self { md5: Md5::new() }
    }

    /// Absorbs the next run of rebuilt or read bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.md5.update(bytes);
    }

    /// Finishes the digest with the session seed.
    #[must_use]
    pub fn finish(mut self, seed: i32) -> [u8; MD5_SUM_LENGTH] {
        self.md5.update(seed.to_le_bytes());
        self.md5.finalize().into()
    }
}

impl Default for FileDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Block-digest prefix length for a file of `file_len` bytes split into
/// `block_count` blocks.
///
/// Grows two bits per doubling of the file length and one per doubling of
/// the block count, so the collision probability stays roughly constant as
/// files grow. Clamped to `[MIN_DIGEST_LENGTH, MAX_DIGEST_LENGTH]`.
#[must_use]
pub fn digest_len(file_len: u64, block_count: u64) -> usize {
    let mut bits = BLOCKSUM_BIAS;
    let mut len = file_len;
    while len > 0 {
        bits += 2;
        len >>= 1;
    }
    let mut count = block_count;
    while count > 0 {
        bits += 1;
        count >>= 1;
    }

    (bits as usize).div_ceil(8).clamp(MIN_DIGEST_LENGTH, MAX_DIGEST_LENGTH)
}
