use std::io;

use engine::EngineError;
use protocol::ProtocolError;

/// Errors raised while configuring or running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    /// The configuration file was malformed.
    #[error("configuration line {line}: {reason}")]
    Config {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A module name violated the `\w+` constraint.
    #[error("invalid module name {0:?}")]
    BadModuleName(String),

    /// A requested path tried to leave its module root.
    #[error("path {0:?} escapes the module root")]
    PathEscape(String),

    /// The client asked for a module the configuration does not define.
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    /// Challenge/response verification failed.
    #[error("auth failed on module {0}")]
    AuthFailed(String),

    /// The client asked for a direction the module forbids.
    #[error("module {module} is not {access}")]
    AccessDenied {
        /// Module name.
        module: String,
        /// `readable` or `writable`.
        access: &'static str,
    },

    /// Handshake-level protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transfer-engine failure after the handshake.
    #[error(transparent)]
    Engine(#[from] EngineError),
}
