//! Checkpoint model for working-directory snapshots.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cas::Digest;

/// Free-form metadata attached to a checkpoint.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Checkpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CheckpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for CheckpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// Digest of the file content.
    pub digest: Digest,
    /// Content length in bytes.
    pub size: u64,
    /// POSIX permission bits.
    pub mode: u32,
}

/// A node in a project's timeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier.
    pub id: CheckpointId,
    /// Human-readable label.
    pub label: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Parent node; `None` for a root.
    pub parent_id: Option<CheckpointId>,
    /// Captured files, sorted by path.
    pub files: Vec<FileRecord>,
    /// Opaque caller metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Checkpoint {
    /// Construct a checkpoint with a generated identifier.
    #[must_use]
    pub fn new(
        label: String,
        parent_id: Option<CheckpointId>,
        mut files: Vec<FileRecord>,
        metadata: Metadata,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            id: CheckpointId::generate(),
            label,
            created_at: Utc::now(),
            parent_id,
            files,
            metadata,
        }
    }

    /// Total content bytes referenced.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Look up a record by relative path.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    /// Lightweight listing entry.
    #[must_use]
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            created_at: self.created_at,
            parent_id: self.parent_id.clone(),
            file_count: self.files.len(),
            total_bytes: self.total_bytes(),
        }
    }
}

/// Listing entry for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    /// Identifier.
    pub id: CheckpointId,
    /// Label.
    pub label: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Parent identifier.
    pub parent_id: Option<CheckpointId>,
    /// Number of files captured.
    pub file_count: usize,
    /// Total content bytes referenced.
    pub total_bytes: u64,
}

/// Outcome of a restore, also carried by a failed restore as partial progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Checkpoint that was restored.
    pub checkpoint_id: Option<CheckpointId>,
    /// Files rewritten from the store.
    pub files_written: usize,
    /// Files already byte-identical, left untouched.
    pub files_unchanged: usize,
    /// Files removed because the checkpoint does not contain them.
    pub files_deleted: usize,
    /// Automatic pre-restore backup, when one was taken.
    pub backup_checkpoint_id: Option<CheckpointId>,
}

/// A path that differs between two file sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceEntry {
    /// Relative file path.
    pub file_path: String,
    /// Kind of divergence.
    pub kind: DivergenceKind,
}

/// The type of file divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// File content has changed.
    Modified,
    /// File existed on the left side but not on the right.
    Deleted,
    /// File exists only on the right side.
    Added,
}
