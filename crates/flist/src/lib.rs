//! File-list model shared by every role.
//!
//! A session's view of the tree being transferred: immutable per-entry
//! descriptions ([`FileInfo`]), the rsync-compatible total order on path
//! names, the segmented index space used by incremental recursion
//! ([`Filelist`], [`SharedFilelist`]) and the XMIT-flag wire codec that
//! moves entries between peers.

pub mod attrs;
pub mod entry;
pub mod list;
pub mod order;
pub mod principal;
pub mod wire;

mod error;

pub use attrs::FileAttrs;
pub use entry::FileInfo;
pub use error::FlistError;
pub use list::{Filelist, Segment, SharedFilelist};
pub use principal::{Group, User};
pub use wire::{EntryDecoder, EntryEncoder, WireOptions};
