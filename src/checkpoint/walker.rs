//! Project tree enumeration with an ignore list.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::errors::CheckpointError;

/// Glob patterns excluded from snapshots and from restore deletion.
///
/// A pattern is matched against every path component name and against the
/// full `/`-separated relative path, so `target` excludes a `target`
/// directory at any depth and `docs/*.pdf` excludes only that subtree.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<glob::Pattern>,
}

impl IgnoreList {
    /// Compile `patterns`, skipping (and logging) invalid ones.
    #[must_use]
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| match glob::Pattern::new(raw.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(pattern = raw.as_ref(), %err, "invalid ignore pattern, skipping");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether `relative` (a `/`-separated path) is excluded.
    #[must_use]
    pub fn is_ignored(&self, relative: &str) -> bool {
        if relative.is_empty() {
            return false;
        }
        self.patterns.iter().any(|pattern| {
            pattern.matches(relative) || relative.split('/').any(|part| pattern.matches(part))
        })
    }
}

/// A regular file found under the project root.
#[derive(Debug, Clone)]
pub struct WalkedFile {
    /// Path relative to the root, `/`-separated.
    pub relative: String,
    /// Absolute path on disk.
    pub absolute: PathBuf,
    /// POSIX permission bits.
    pub mode: u32,
}

/// Enumerate regular files under `root`, sorted by relative path.
///
/// Symlinks are not followed and not recorded. Ignored directories are
/// pruned without descending into them.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if a directory cannot be read.
pub fn walk_project(root: &Path, ignore: &IgnoreList) -> Result<Vec<WalkedFile>, CheckpointError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored_entry(root, entry, ignore));

    for entry in walker {
        let entry = entry.map_err(|err| CheckpointError::Io(format!("walk failed: {err}")))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "skipping symlink");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        let metadata = entry
            .metadata()
            .map_err(|err| CheckpointError::Io(format!("stat {relative}: {err}")))?;
        files.push(WalkedFile {
            relative,
            absolute: entry.into_path(),
            mode: permission_bits(&metadata),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// `/`-separated path of `path` relative to `root`.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_ignored_entry(root: &Path, entry: &DirEntry, ignore: &IgnoreList) -> bool {
    relative_path(root, entry.path()).is_some_and(|relative| ignore.is_ignored(&relative))
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply recorded permission bits to `path`.
///
/// # Errors
///
/// Returns the underlying I/O error if the permissions cannot be set.
#[cfg(unix)]
pub fn apply_permission_bits(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Apply recorded permission bits to `path`.
///
/// # Errors
///
/// Returns the underlying I/O error if the permissions cannot be set.
#[cfg(not(unix))]
pub fn apply_permission_bits(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, permissions)
}
