//! Client-side session driving and shared plumbing.
//!
//! Everything the `rrsync` binary needs that is not the transfer engine
//! itself: the client URL grammar, the daemon handshake state machine from
//! the client's seat, module listings, password sources, the local-copy
//! fallback and the exit-code mapping.

pub mod client;
pub mod exit_code;
pub mod password;

mod error;

pub use client::{ClientConfig, SessionSummary, run_client};
pub use client::url::{DaemonTarget, Endpoint};
pub use error::ClientError;
pub use exit_code::ExitCode;
