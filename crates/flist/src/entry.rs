//! Immutable per-entry descriptions.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crate::attrs::FileAttrs;
use crate::error::FlistError;
use crate::order::{self, DOT_DIR};

/// One entry of the transfer's file list.
///
/// Created by the sender's tree walk or the receiver's parse of an incoming
/// segment and never mutated afterwards, except for the two transfer flags:
/// `pruned` (directories, set by the generator) and `transferred` (regular
/// files, set by the sender or receiver). Both flags only ever go from
/// false to true.
pub struct FileInfo {
    /// Absolute local path. Present on the end that owns the bytes; absent
    /// on the receiving side's picture of remote-only entries.
    path: Option<PathBuf>,
    /// Raw path-name bytes exactly as transmitted. Directories carry one
    /// trailing `/` (the dot directory stays bare).
    name: Vec<u8>,
    attrs: FileAttrs,
    /// Symlink target bytes, when the entry is a link and links travel.
    link_target: Option<Vec<u8>>,
    pruned: AtomicBool,
    transferred: AtomicBool,
}

impl FileInfo {
    /// Builds an entry, normalizing and validating the wire name.
    ///
    /// A trailing `/` is appended to directory names exactly when absent;
    /// non-directories must not carry one.
    pub fn new(
        path: Option<PathBuf>,
        name: impl Into<Vec<u8>>,
        attrs: FileAttrs,
        link_target: Option<Vec<u8>>,
    ) -> Result<Self, FlistError> {
        let mut name = name.into();
        if name.is_empty() {
            return Err(FlistError::BadName("empty"));
        }
        if name[0] == b'/' {
            return Err(FlistError::BadName("absolute"));
        }
        if name.contains(&0) {
            return Err(FlistError::BadName("embedded NUL"));
        }
        // Wire names from a peer resolve against the destination root; a
        // `..` segment would climb out of it.
        if name.split(|&b| b == b'/').any(|segment| segment == b"..") {
            return Err(FlistError::BadName("parent traversal"));
        }

        if attrs.is_dir() {
            if name != DOT_DIR && name.last() != Some(&b'/') {
                name.push(b'/');
            }
        } else if name.last() == Some(&b'/') {
            return Err(FlistError::BadName("trailing slash on a non-directory"));
        }

        if link_target.is_some() && !attrs.is_symlink() {
            return Err(FlistError::BadEntry("link target on a non-symlink"));
        }

        Ok(Self {
            path,
            name,
            attrs,
            link_target,
            pruned: AtomicBool::new(false),
            transferred: AtomicBool::new(false),
        })
    }

    /// Builds the dot directory describing the transfer root.
    pub fn dot_dir(path: Option<PathBuf>, attrs: FileAttrs) -> Result<Self, FlistError> {
        if !attrs.is_dir() {
            return Err(FlistError::BadEntry("dot dir must be a directory"));
        }
        Ok(Self {
            path,
            name: DOT_DIR.to_vec(),
            attrs,
            link_target: None,
            pruned: AtomicBool::new(false),
            transferred: AtomicBool::new(false),
        })
    }

    /// Raw wire name bytes.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Wire name without the directory slash, suitable for path joining.
    #[must_use]
    pub fn trimmed_name(&self) -> &[u8] {
        if self.name != DOT_DIR && self.name.last() == Some(&b'/') {
            &self.name[..self.name.len() - 1]
        } else {
            &self.name
        }
    }

    /// Normalized relative path of the entry.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        bytes_to_path(self.trimmed_name())
    }

    /// Absolute local path, when this end has one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entry attributes.
    #[must_use]
    pub fn attrs(&self) -> &FileAttrs {
        &self.attrs
    }

    /// Symlink target bytes, when present.
    #[must_use]
    pub fn link_target(&self) -> Option<&[u8]> {
        self.link_target.as_deref()
    }

    /// True for the dot directory.
    #[must_use]
    pub fn is_dot_dir(&self) -> bool {
        self.name == DOT_DIR
    }

    /// Marks a directory as pruned. Never cleared.
    pub fn set_pruned(&self) {
        debug_assert!(self.attrs.is_dir());
        self.pruned.store(true, AtomicOrdering::Release);
    }

    /// True once the generator pruned this directory.
    #[must_use]
    pub fn is_pruned(&self) -> bool {
        self.pruned.load(AtomicOrdering::Acquire)
    }

    /// Marks a regular file as transferred. Never cleared.
    pub fn set_transferred(&self) {
        debug_assert!(self.attrs.is_regular());
        self.transferred.store(true, AtomicOrdering::Release);
    }

    /// True once the file's content transfer completed and verified.
    #[must_use]
    pub fn is_transferred(&self) -> bool {
        self.transferred.load(AtomicOrdering::Acquire)
    }
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInfo")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("mode", &format_args!("{:o}", self.attrs.mode()))
            .field("size", &self.attrs.size())
            .finish_non_exhaustive()
    }
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FileInfo {}

impl PartialOrd for FileInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        order::compare_paths(&self.name, &other.name)
    }
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{S_IFDIR, S_IFLNK, S_IFREG};
    use crate::principal::{Group, User};

    fn attrs(mode: u32) -> FileAttrs {
        FileAttrs::new(mode, 0, 0, User::root(), Group::root())
    }

    #[test]
    fn directory_names_gain_exactly_one_slash() {
        let dir = FileInfo::new(None, b"sub".to_vec(), attrs(S_IFDIR | 0o755), None)
            .expect("valid entry");
        assert_eq!(dir.name(), b"sub/");

        let already = FileInfo::new(None, b"sub/".to_vec(), attrs(S_IFDIR | 0o755), None)
            .expect("valid entry");
        assert_eq!(already.name(), b"sub/");
    }

    #[test]
    fn regular_files_reject_trailing_slashes() {
        assert!(FileInfo::new(None, b"f/".to_vec(), attrs(S_IFREG | 0o644), None).is_err());
    }

    #[test]
    fn dot_dir_stays_bare() {
        let dot = FileInfo::dot_dir(None, attrs(S_IFDIR | 0o755)).expect("valid dot dir");
        assert_eq!(dot.name(), b".");
        assert!(dot.is_dot_dir());
    }

    #[test]
    fn absolute_and_nul_names_are_rejected() {
        assert!(FileInfo::new(None, b"/etc".to_vec(), attrs(S_IFREG), None).is_err());
        assert!(FileInfo::new(None, b"a\0b".to_vec(), attrs(S_IFREG), None).is_err());
    }

    #[test]
    fn parent_traversal_names_are_rejected() {
        assert!(FileInfo::new(None, b"../escape".to_vec(), attrs(S_IFREG), None).is_err());
        assert!(FileInfo::new(None, b"a/../b".to_vec(), attrs(S_IFREG), None).is_err());
        // A name merely containing dots is fine.
        assert!(FileInfo::new(None, b"a..b".to_vec(), attrs(S_IFREG), None).is_ok());
    }

    #[test]
    fn link_target_requires_a_symlink() {
        assert!(
            FileInfo::new(
                None,
                b"ln".to_vec(),
                attrs(S_IFLNK | 0o777),
                Some(b"target".to_vec()),
            )
            .is_ok()
        );
        assert!(
            FileInfo::new(
                None,
                b"f".to_vec(),
                attrs(S_IFREG | 0o644),
                Some(b"target".to_vec()),
            )
            .is_err()
        );
    }

    #[test]
    fn transfer_flags_start_clear_and_latch() {
        let file =
            FileInfo::new(None, b"f".to_vec(), attrs(S_IFREG | 0o644), None).expect("valid entry");
        assert!(!file.is_transferred());
        file.set_transferred();
        assert!(file.is_transferred());

        let dir =
            FileInfo::new(None, b"d".to_vec(), attrs(S_IFDIR | 0o755), None).expect("valid entry");
        assert!(!dir.is_pruned());
        dir.set_pruned();
        assert!(dir.is_pruned());
    }

    #[test]
    fn relative_path_strips_the_directory_slash() {
        let dir = FileInfo::new(None, b"a/b".to_vec(), attrs(S_IFDIR | 0o755), None)
            .expect("valid entry");
        assert_eq!(dir.relative_path(), PathBuf::from("a/b"));
    }

    #[test]
    fn entries_order_by_wire_name() {
        let file =
            FileInfo::new(None, b"x".to_vec(), attrs(S_IFREG | 0o644), None).expect("valid entry");
        let dir =
            FileInfo::new(None, b"x".to_vec(), attrs(S_IFDIR | 0o755), None).expect("valid entry");
        assert!(file < dir);
    }
}
