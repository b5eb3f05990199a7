use std::io;
use std::path::PathBuf;

use flist::FlistError;
use protocol::ProtocolError;

/// Errors that unwind a role loop.
///
/// Per-file failures do not take this path; they are counted in the session
/// statistics and surface as the partial-transfer exit code.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Wire-level failure. Fatal.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// File-list codec failure. Fatal.
    #[error(transparent)]
    Flist(#[from] FlistError),

    /// The peer violated the transfer-phase sequencing.
    #[error("transfer protocol violation: {0}")]
    Sequence(&'static str),

    /// The session argument vector was malformed.
    #[error("bad session arguments: {0}")]
    Args(String),

    /// A local filesystem operation outside per-file handling failed.
    #[error("filesystem error on {path}: {source}")]
    Filesystem {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The peer cancelled the session or a sibling role failed.
    #[error("session cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}
