//! The rsync daemon.
//!
//! Listens for plain-TCP connections, speaks the `@RSYNCD` handshake,
//! authenticates clients against per-module secrets, sandboxes requested
//! paths inside the module root and hands the established session to the
//! transfer engine with the server-side role.

pub mod auth;
pub mod config;
pub mod restrict;
pub mod server;

mod error;

pub use config::{DaemonConfig, Module};
pub use error::DaemonError;
pub use restrict::RestrictedPath;
pub use server::{Daemon, DEFAULT_PORT};
