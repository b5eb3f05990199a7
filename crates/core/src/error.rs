use std::io;

use engine::EngineError;
use protocol::ProtocolError;

use crate::exit_code::ExitCode;

/// Errors surfaced to the binary, each carrying its exit code.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Bad command line or URL.
    #[error("usage error: {0}")]
    Usage(String),

    /// The daemon refused the session before it started.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Authentication was requested but no credentials are available, or
    /// they were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Socket-level failure.
    #[error("cannot {action} {target}: {source}")]
    Socket {
        /// What was being attempted.
        action: &'static str,
        /// Peer or address involved.
        target: String,
        /// Underlying error.
        source: io::Error,
    },

    /// Wire-protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transfer-engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The session finished, but files failed along the way.
    #[error("{failed} files could not be transferred")]
    Partial {
        /// Number of per-file failures.
        failed: u64,
    },
}

impl ClientError {
    /// Exit code this error maps onto.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Usage(_) => ExitCode::Syntax,
            Self::Daemon(_) | Self::Auth(_) => ExitCode::StartClient,
            Self::Socket { .. } | Self::Protocol(_) => ExitCode::SocketIo,
            Self::Engine(EngineError::Filesystem { .. }) | Self::Partial { .. } => {
                ExitCode::PartialTransfer
            }
            Self::Engine(_) => ExitCode::SocketIo,
        }
    }
}

pub(crate) fn socket_error(
    action: &'static str,
    target: impl Into<String>,
    source: io::Error,
) -> ClientError {
    ClientError::Socket {
        action,
        target: target.into(),
        source,
    }
}
