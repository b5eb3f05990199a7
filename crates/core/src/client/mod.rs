//! The client side of a session.

pub mod url;

mod local;
mod module_list;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use engine::{ServerStats, SessionOptions, SessionStats};
use filters::FilterSet;
use protocol::TextCodec;

use crate::error::ClientError;
use crate::exit_code::ExitCode;
use self::url::Endpoint;

/// Default per-read socket timeout for client sessions.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a client invocation needs.
#[derive(Debug)]
pub struct ClientConfig {
    /// Transfer source.
    pub source: Endpoint,
    /// Transfer destination; absent for module listings.
    pub dest: Option<Endpoint>,
    /// Session options.
    pub opts: SessionOptions,
    /// Include/exclude rules, applied on the sending side.
    pub filters: FilterSet,
    /// `--password-file` argument.
    pub password_file: Option<PathBuf>,
    /// Charset for daemon text (listings, messages).
    pub charset: TextCodec,
    /// Per-read socket timeout; `None` disables it.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// A config with defaults for everything but the endpoints.
    #[must_use]
    pub fn new(source: Endpoint, dest: Option<Endpoint>) -> Self {
        Self {
            source,
            dest,
            opts: SessionOptions::default(),
            filters: FilterSet::new(),
            password_file: None,
            charset: TextCodec::utf8(),
            timeout: Some(SOCKET_TIMEOUT),
        }
    }
}

/// What a finished session reports back.
#[derive(Debug, Default)]
pub struct SessionSummary {
    /// Entries in the transferred file list.
    pub num_files: u64,
    /// Regular files whose content moved and verified.
    pub num_transferred: u64,
    /// Total size of listed regular files.
    pub total_size: u64,
    /// Literal bytes that crossed the wire.
    pub literal_bytes: u64,
    /// Bytes reconstructed from local basis files.
    pub matched_bytes: u64,
    /// Per-file failures.
    pub errors: u64,
    /// Statistics the server reported at end of session.
    pub server_stats: Option<ServerStats>,
    /// Module-listing lines, when a listing ran instead of a transfer.
    pub module_list: Vec<String>,
}

impl SessionSummary {
    pub(crate) fn from_stats(stats: &SessionStats, server_stats: Option<ServerStats>) -> Self {
        Self {
            num_files: stats.get(&stats.num_files),
            num_transferred: stats.get(&stats.num_transferred),
            total_size: stats.get(&stats.total_size),
            literal_bytes: stats.get(&stats.literal_bytes),
            matched_bytes: stats.get(&stats.matched_bytes),
            errors: stats.get(&stats.errors),
            server_stats,
            module_list: Vec::new(),
        }
    }

    /// The exit code the session earned.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.errors > 0 {
            ExitCode::PartialTransfer
        } else {
            ExitCode::Ok
        }
    }
}

/// Runs one client invocation: a transfer, a local copy or a listing.
pub fn run_client(cfg: &ClientConfig) -> Result<SessionSummary, ClientError> {
    match (&cfg.source, &cfg.dest) {
        (Endpoint::Daemon(target), None) => {
            if target.path.is_empty() {
                module_list::run(cfg, target)
            } else {
                Err(ClientError::Usage(
                    "destination required for a transfer".to_string(),
                ))
            }
        }
        (_, None) => Err(ClientError::Usage(
            "destination required for a transfer".to_string(),
        )),
        (Endpoint::Daemon(_), Some(Endpoint::Daemon(_))) => Err(ClientError::Usage(
            "only one endpoint may be remote".to_string(),
        )),
        (Endpoint::Daemon(target), Some(Endpoint::Local(dest))) => {
            session::run_transfer(cfg, target, session::Direction::Download { dest })
        }
        (Endpoint::Local(source), Some(Endpoint::Daemon(target))) => {
            session::run_transfer(cfg, target, session::Direction::Upload { source })
        }
        (Endpoint::Local(source), Some(Endpoint::Local(dest))) => {
            local::run_local_copy(cfg, source, dest)
        }
    }
}
