//! Path validation and symlink-escape detection for restores.
//!
//! Every file a restore writes or deletes must stay inside the target root.
//! Record paths are relative and `/`-separated; anything absolute, any `..`
//! that climbs out of the root, and any symlink whose target leaves the root
//! is refused.

use std::path::{Component, Path, PathBuf};

/// Resolve `record_path` under the canonical `root`.
///
/// `root` must already be canonicalized. Returns the absolute path to write
/// on success.
///
/// # Errors
///
/// Returns a diagnostic string if:
/// - The record path is empty or absolute.
/// - The record path contains `..` segments that escape the root.
/// - The deepest existing ancestor of the resolved path, or the path itself,
///   resolves through a symlink to a location outside the root.
pub fn resolve_record_path(root: &Path, record_path: &str) -> Result<PathBuf, String> {
    if record_path.is_empty() {
        return Err("empty path".into());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(record_path).components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err("path attempts to escape the target root".into());
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute paths are not allowed".into());
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err("path resolves to the target root itself".into());
    }

    let absolute = root.join(&normalized);

    // The path itself may be a symlink; the deepest existing ancestor may be
    // a symlinked directory. Both must resolve inside the root.
    let existing = absolute
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or(root);
    let canonical = existing
        .canonicalize()
        .map_err(|err| format!("cannot resolve path: {err}"))?;
    if !canonical.starts_with(root) {
        return Err("symlink target escapes the target root".into());
    }

    Ok(absolute)
}
