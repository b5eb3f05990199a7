//! File attributes as they travel the wire.
//!
//! Modes use the POSIX encoding regardless of the host platform: a type
//! nibble in the high bits plus nine permission bits. Sizes and mtimes are
//! non-negative; mtimes are whole seconds.

use crate::principal::{Group, User};

/// Mask of the file-type bits.
pub const S_IFMT: u32 = 0o170000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;
/// Mask of the nine permission bits.
pub const PERM_MASK: u32 = 0o777;

/// Attributes of one tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    mode: u32,
    size: u64,
    mtime: i64,
    user: User,
    group: Group,
}

impl FileAttrs {
    /// Builds an attribute set. `mtime` is clamped to zero; the protocol
    /// has no representation for pre-epoch timestamps.
    #[must_use]
    pub fn new(mode: u32, size: u64, mtime: i64, user: User, group: Group) -> Self {
        Self {
            mode,
            size,
            mtime: mtime.max(0),
            user,
            group,
        }
    }

    /// Full mode word (type bits plus permissions).
    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// File size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time in whole seconds since the epoch.
    #[must_use]
    pub const fn mtime(&self) -> i64 {
        self.mtime
    }

    /// Owning user.
    #[must_use]
    pub const fn user(&self) -> &User {
        &self.user
    }

    /// Owning group.
    #[must_use]
    pub const fn group(&self) -> &Group {
        &self.group
    }

    /// The nine permission bits.
    #[must_use]
    pub const fn perms(&self) -> u32 {
        self.mode & PERM_MASK
    }

    /// True for directories.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// True for regular files.
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// True for symbolic links.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// True for types this implementation never creates locally (devices,
    /// sockets, fifos). They may be listed but are skipped per file.
    #[must_use]
    pub const fn is_other(&self) -> bool {
        !self.is_dir() && !self.is_regular() && !self.is_symlink()
    }

    /// Settable equality: attributes agree for skip decisions when their
    /// mtimes agree.
    #[must_use]
    pub const fn settable_eq(&self, other: &Self) -> bool {
        self.mtime == other.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(mode: u32, size: u64, mtime: i64) -> FileAttrs {
        FileAttrs::new(mode, size, mtime, User::root(), Group::root())
    }

    #[test]
    fn type_predicates_follow_the_mode_bits() {
        assert!(attrs(S_IFDIR | 0o755, 0, 0).is_dir());
        assert!(attrs(S_IFREG | 0o644, 1, 0).is_regular());
        assert!(attrs(S_IFLNK | 0o777, 1, 0).is_symlink());
        assert!(attrs(0o010644, 0, 0).is_other()); // fifo
    }

    #[test]
    fn perms_project_the_low_nine_bits() {
        assert_eq!(attrs(S_IFREG | 0o4755, 0, 0).perms(), 0o755);
    }

    #[test]
    fn settable_equality_ignores_everything_but_mtime() {
        let a = attrs(S_IFREG | 0o644, 10, 100);
        let b = attrs(S_IFREG | 0o600, 99, 100);
        let c = attrs(S_IFREG | 0o644, 10, 101);
        assert!(a.settable_eq(&b));
        assert!(!a.settable_eq(&c));
    }

    #[test]
    fn negative_mtimes_clamp_to_epoch() {
        assert_eq!(attrs(S_IFREG, 0, -5).mtime(), 0);
    }
}
