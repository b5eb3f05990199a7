//! MD5 challenge/response primitive.
//!
//! Daemon authentication hashes the secret with the server-chosen
//! challenge and ships the digest base64-encoded without padding. The
//! primitive lives with the byte codecs because both ends of a connection
//! must produce identical bytes for identical inputs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use md5::{Digest, Md5};

/// `base64_nopad(MD5(password ∥ challenge))`.
#[must_use]
pub fn challenge_response(password: &[u8], challenge: &str) -> String {
    let mut md5 = Md5::new();
    md5.update(password);
    md5.update(challenge.as_bytes());
    STANDARD_NO_PAD.encode(md5.finalize())
}
