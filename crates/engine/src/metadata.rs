//! Principal resolution and metadata application.
//!
//! Host identities are resolved through the passwd/group databases once
//! per distinct id and cached for the session, so the tree walk never
//! repeats the lookup and nothing queries the OS mid-transfer. Application
//! maps the other way: wire principals back onto local ids, by name first
//! and by number as the fallback.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use filetime::FileTime;
use flist::principal::MAX_ID;
use flist::{FileAttrs, Group, User};

use crate::session::SessionOptions;

/// Session-lifetime cache of id-to-principal lookups.
#[derive(Debug, Default)]
pub struct IdCache {
    users: HashMap<u32, User>,
    groups: HashMap<u32, Group>,
}

impl IdCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Principal for a host uid. Ids outside the wire range and unnamed
    /// ids fall back to a numeric name.
    pub fn user(&mut self, uid: u32) -> User {
        if uid > MAX_ID {
            return User::nobody();
        }
        self.users
            .entry(uid)
            .or_insert_with(|| {
                lookup_user_name(uid)
                    .and_then(|name| User::new(name, uid).ok())
                    .unwrap_or_else(|| {
                        User::new(uid.to_string(), uid).unwrap_or_else(|_| User::nobody())
                    })
            })
            .clone()
    }

    /// Principal for a host gid.
    pub fn group(&mut self, gid: u32) -> Group {
        if gid > MAX_ID {
            return Group::nobody();
        }
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                lookup_group_name(gid)
                    .and_then(|name| Group::new(name, gid).ok())
                    .unwrap_or_else(|| {
                        Group::new(gid.to_string(), gid).unwrap_or_else(|_| Group::nobody())
                    })
            })
            .clone()
    }
}

/// Applies received attributes to a rebuilt or existing path.
///
/// Permission bits when `--perms`, mtime when `--times`, ownership when
/// `--owner`/`--group` and running as root. Symlinks only ever get their
/// ownership touched; their permissions and times are not settable
/// portably.
pub fn apply_metadata(path: &Path, attrs: &FileAttrs, opts: &SessionOptions) -> io::Result<()> {
    let is_symlink = attrs.is_symlink();

    if opts.preserve_perms && !is_symlink {
        set_permissions(path, attrs.perms())?;
    }

    if opts.preserve_times && !is_symlink {
        filetime::set_file_mtime(path, FileTime::from_unix_time(attrs.mtime(), 0))?;
    }

    if (opts.preserve_uid || opts.preserve_gid) && can_change_owner() {
        let uid = opts
            .preserve_uid
            .then(|| resolve_uid(attrs.user(), opts.numeric_ids));
        let gid = opts
            .preserve_gid
            .then(|| resolve_gid(attrs.group(), opts.numeric_ids));
        change_owner(path, uid, gid)?;
    }

    Ok(())
}

/// The process umask, captured once.
///
/// Newly created files take `0666 & !umask` when permissions are not being
/// preserved, the way a plain `open(2)` would create them.
pub fn process_umask() -> u32 {
    static UMASK: OnceLock<u32> = OnceLock::new();
    *UMASK.get_or_init(|| {
        #[cfg(unix)]
        // Restored immediately; the only way POSIX offers to read it.
        unsafe {
            let current = libc::umask(0);
            libc::umask(current);
            current as u32
        }
        #[cfg(not(unix))]
        {
            0o022
        }
    })
}

/// Sets plain permission bits on a path.
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    set_permissions(path, mode)
}

#[cfg(unix)]
fn set_permissions(path: &Path, perms: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perms))
}

#[cfg(not(unix))]
fn set_permissions(path: &Path, perms: u32) -> io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(perms & 0o200 == 0);
    std::fs::set_permissions(path, permissions)
}

#[cfg(unix)]
fn can_change_owner() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn can_change_owner() -> bool {
    false
}

#[cfg(unix)]
fn change_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    use nix::unistd::{Gid, Uid, chown};

    chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw)).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn change_owner(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
    Ok(())
}

/// Maps a wire user to a local uid: by name unless `--numeric-ids`, the
/// transmitted id otherwise.
fn resolve_uid(user: &User, numeric_ids: bool) -> u32 {
    if !numeric_ids {
        if let Some(uid) = lookup_uid_by_name(user.name()) {
            return uid;
        }
    }
    user.id()
}

fn resolve_gid(group: &Group, numeric_ids: bool) -> u32 {
    if !numeric_ids {
        if let Some(gid) = lookup_gid_by_name(group.name()) {
            return gid;
        }
    }
    group.id()
}

#[cfg(unix)]
fn lookup_user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

#[cfg(unix)]
fn lookup_group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

#[cfg(unix)]
fn lookup_uid_by_name(name: &str) -> Option<u32> {
    nix::unistd::User::from_name(name)
        .ok()
        .flatten()
        .map(|user| user.uid.as_raw())
}

#[cfg(unix)]
fn lookup_gid_by_name(name: &str) -> Option<u32> {
    nix::unistd::Group::from_name(name)
        .ok()
        .flatten()
        .map(|group| group.gid.as_raw())
}

#[cfg(not(unix))]
fn lookup_user_name(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_group_name(_gid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_uid_by_name(_name: &str) -> Option<u32> {
    None
}

#[cfg(not(unix))]
fn lookup_gid_by_name(_name: &str) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flist::attrs::S_IFREG;

    #[test]
    fn out_of_range_ids_map_to_nobody() {
        let mut ids = IdCache::new();
        assert_eq!(ids.user(1_000_000), User::nobody());
        assert_eq!(ids.group(1_000_000), Group::nobody());
    }

    #[test]
    fn lookups_are_cached_per_id() {
        let mut ids = IdCache::new();
        let first = ids.user(0);
        let second = ids.user(0);
        assert_eq!(first, second);
        assert_eq!(first.id(), 0);
    }

    #[test]
    fn mtime_and_perms_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").expect("write");

        let attrs = FileAttrs::new(
            S_IFREG | 0o640,
            1,
            1_000_000,
            User::root(),
            Group::root(),
        );
        let opts = SessionOptions {
            preserve_perms: true,
            preserve_times: true,
            ..SessionOptions::default()
        };
        apply_metadata(&path, &attrs, &opts).expect("apply");

        let meta = std::fs::metadata(&path).expect("stat");
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_000_000
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        }
    }
}
