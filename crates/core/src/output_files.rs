//! Output artifact detection.
//!
//! A hook's artifacts are whatever files appear in its plugin output
//! directory. Paths are reported relative to that directory with `/`
//! separators. Directory symlinks are not followed, so a listing never
//! escapes the root.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use walkdir::WalkDir;

use crate::error::CoreError;

/// Recursively list every file beneath `root`, relative to `root`.
///
/// A missing `root` yields an empty set. Entries that cannot be read (for
/// example a subdirectory without read permission) are logged and skipped;
/// the rest of the tree is still listed.
pub fn list_files(root: &Path) -> BTreeSet<String> {
    if !root.exists() {
        return BTreeSet::new();
    }

    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(
                    root = %root.display(),
                    path = ?e.path(),
                    error = %e,
                    "Skipping unreadable entry in output directory",
                );
                None
            }
        })
        .filter(|entry| {
            let file_type = entry.file_type();
            file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())
        })
        .filter_map(|entry| match relative_path(root, entry.path()) {
            Ok(rel) => Some(rel),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring output file outside its directory");
                None
            }
        })
        .collect()
}

/// Files present in `after` but not in `before`, in sorted order.
pub fn new_files(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<String> {
    after.difference(before).cloned().collect()
}

/// Express `path` relative to `root` using `/` separators.
///
/// Fails with [`CoreError::PathEscape`] when `path` is not strictly inside
/// `root`.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, CoreError> {
    let escape = || CoreError::PathEscape {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    let rel = path.strip_prefix(root).map_err(|_| escape())?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(escape()),
        }
    }
    if parts.is_empty() {
        return Err(escape());
    }
    Ok(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
