//! Checksum primitives for the rsync delta algorithm.
//!
//! Two digests cooperate during block matching: the 32-bit rolling weak
//! checksum ([`RollingChecksum`]) locates candidate blocks in O(1) per
//! window position, and the seeded MD5 strong digest ([`block_digest`],
//! [`FileDigest`]) confirms them. Both are bit-compatible with what a
//! protocol-30 rsync peer computes.

mod rolling;
mod strong;

pub use rolling::{RollingChecksum, RollingError};
pub use strong::{
    FileDigest, MAX_DIGEST_LENGTH, MD5_SUM_LENGTH, MIN_DIGEST_LENGTH, block_digest, digest_len,
};
