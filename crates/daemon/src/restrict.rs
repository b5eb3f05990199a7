//! Module-rooted path resolution.
//!
//! Client-supplied paths are untrusted. Resolution normalizes the request,
//! demands the leading segment name the module itself, and refuses any
//! `..` component, so the result provably stays inside the module root.

use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// True for names matching `\w+` (ASCII letters, digits, underscore).
#[must_use]
pub fn module_name_is_valid(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// A module name bound to its absolute root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedPath {
    module: String,
    root: PathBuf,
}

impl RestrictedPath {
    /// Binds `module` to `root`.
    pub fn new(module: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let module = module.into();
        if !module_name_is_valid(&module) {
            return Err(DaemonError::BadModuleName(module));
        }
        let root = root.into();
        debug_assert!(root.is_absolute());
        Ok(Self { module, root })
    }

    /// Module name.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Module root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an untrusted request path against the module root.
    ///
    /// The request must start with the module name; the remainder is
    /// normalized (empty and `.` segments dropped, `a/..` pairs
    /// cancelled). A `..` surviving normalization would climb out of the
    /// root and fails with a security error.
    pub fn resolve(&self, untrusted: &str) -> Result<PathBuf, DaemonError> {
        let mut segments = untrusted.split('/').filter(|s| !s.is_empty() && *s != ".");

        if segments.next() != Some(self.module.as_str()) {
            return Err(DaemonError::PathEscape(untrusted.to_string()));
        }

        let mut normalized: Vec<&str> = Vec::new();
        for segment in segments {
            if segment == ".." {
                if normalized.pop().is_none() {
                    return Err(DaemonError::PathEscape(untrusted.to_string()));
                }
            } else {
                normalized.push(segment);
            }
        }

        let mut resolved = self.root.clone();
        resolved.extend(normalized);
        Ok(resolved)
    }
}
