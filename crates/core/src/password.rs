//! Password sources for daemon authentication.
//!
//! `--password-file` wins over the `RSYNC_PASSWORD` environment variable;
//! with neither present the client has nothing to answer a challenge with.

use std::fs;
use std::path::Path;

use crate::error::ClientError;

/// Environment variable consulted when no password file is given.
pub const PASSWORD_ENV: &str = "RSYNC_PASSWORD";

/// Loads the daemon password, if any source provides one.
///
/// A password file's first line is the secret; the trailing newline is not
/// part of it.
pub fn load(password_file: Option<&Path>) -> Result<Option<Vec<u8>>, ClientError> {
    if let Some(path) = password_file {
        let text = fs::read_to_string(path).map_err(|err| {
            ClientError::Auth(format!("cannot read password file {}: {err}", path.display()))
        })?;
        let line = text.lines().next().unwrap_or_default();
        return Ok(Some(line.as_bytes().to_vec()));
    }

    Ok(std::env::var(PASSWORD_ENV)
        .ok()
        .map(String::into_bytes))
}
