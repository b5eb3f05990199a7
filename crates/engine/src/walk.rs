//! Local tree walking for the sender.
//!
//! Lists one directory at a time; incremental recursion turns each listing
//! into its own file-list segment. Attribute snapshots happen here, once,
//! so an entry's wire description never disagrees with what the delta pass
//! later reads.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use filters::FilterSet;
use flist::{FileAttrs, FileInfo};

use crate::error::EngineError;
use crate::metadata::IdCache;
use crate::session::SessionOptions;

/// Result of listing one directory.
pub struct DirListing {
    /// Entries that made it into the segment.
    pub files: Vec<Arc<FileInfo>>,
    /// Per-file stat failures encountered while listing.
    pub errors: u64,
}

/// Builds the dot-dir entry for the transfer root.
pub fn root_entry(root: &Path, ids: &mut IdCache) -> Result<Arc<FileInfo>, EngineError> {
    let meta = fs::metadata(root).map_err(|err| EngineError::fs(root, err))?;
    if !meta.is_dir() {
        return Err(EngineError::fs(
            root,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "transfer root"),
        ));
    }
    let attrs = attrs_from_metadata(&meta, ids);
    let info = FileInfo::dot_dir(Some(root.to_path_buf()), attrs)?;
    Ok(Arc::new(info))
}

/// Lists the children of `dir`.
///
/// `dir_name` is the directory's wire name (slash-terminated, or `.` for
/// the root); children prepend it to their own names. Entries the filter
/// set drops, and entry types the session options exclude, never appear.
pub fn list_children(
    dir: &Path,
    dir_name: &[u8],
    opts: &SessionOptions,
    filters: &FilterSet,
    ids: &mut IdCache,
) -> Result<DirListing, EngineError> {
    let mut files = Vec::new();
    let mut errors = 0u64;

    let entries = fs::read_dir(dir).map_err(|err| EngineError::fs(dir, err))?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "cannot list entry");
                errors += 1;
                continue;
            }
        };

        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot stat entry");
                errors += 1;
                continue;
            }
        };

        let file_type = meta.file_type();
        if file_type.is_dir() && !opts.lists_dirs() {
            continue;
        }
        if file_type.is_symlink() && !opts.preserve_links {
            tracing::debug!(path = %path.display(), "skipping symlink without --links");
            continue;
        }
        if !file_type.is_dir() && !file_type.is_file() && !file_type.is_symlink() {
            tracing::warn!(path = %path.display(), "skipping special file");
            continue;
        }

        let mut name = if dir_name == b"." {
            Vec::new()
        } else {
            dir_name.to_vec()
        };
        name.extend_from_slice(&name_bytes(&entry.file_name()));

        let rel = std::path::PathBuf::from(String::from_utf8_lossy(&name).into_owned());
        if !filters.keeps(&rel, file_type.is_dir()) {
            tracing::debug!(path = %path.display(), "excluded by filter");
            continue;
        }

        let link_target = if file_type.is_symlink() {
            match fs::read_link(&path) {
                Ok(target) => Some(name_bytes(target.as_os_str())),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "cannot read link");
                    errors += 1;
                    continue;
                }
            }
        } else {
            None
        };

        let attrs = attrs_from_metadata(&meta, ids);
        match FileInfo::new(Some(path.clone()), name, attrs, link_target) {
            Ok(info) => files.push(Arc::new(info)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unlistable entry");
                errors += 1;
            }
        }
    }

    Ok(DirListing { files, errors })
}

#[cfg(unix)]
fn attrs_from_metadata(meta: &fs::Metadata, ids: &mut IdCache) -> FileAttrs {
    use std::os::unix::fs::MetadataExt;

    use flist::attrs::S_IFMT;

    // Project the host mode onto the wire encoding; the type values agree
    // on every Unix this builds for, so only the mask is applied.
    let mode = meta.mode() & (S_IFMT | 0o7777);
    FileAttrs::new(
        mode,
        meta.len(),
        meta.mtime(),
        ids.user(meta.uid()),
        ids.group(meta.gid()),
    )
}

#[cfg(not(unix))]
fn attrs_from_metadata(meta: &fs::Metadata, ids: &mut IdCache) -> FileAttrs {
    use flist::attrs::{S_IFDIR, S_IFLNK, S_IFREG};

    let type_bits = if meta.is_dir() {
        S_IFDIR
    } else if meta.file_type().is_symlink() {
        S_IFLNK
    } else {
        S_IFREG
    };
    let perms = if meta.permissions().readonly() { 0o555 } else { 0o755 };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);
    FileAttrs::new(type_bits | perms, meta.len(), mtime, ids.user(0), ids.group(0))
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}
