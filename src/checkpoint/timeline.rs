//! Append-only timeline index for one project.
//!
//! The index is a JSON Lines file. Each line is a [`TimelineRecord`]: either
//! a full checkpoint node or a head marker. New records are appended with a
//! single write, so creating a checkpoint costs the size of that checkpoint
//! and never rewrites history. A torn trailing line (a crash mid-append) is
//! skipped on load, and the next append terminates it first so the new
//! record is not glued onto the fragment.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::cas::Digest;
use crate::errors::CheckpointError;
use crate::models::checkpoint::{Checkpoint, CheckpointId, CheckpointSummary};

/// File name of the index inside a project directory.
pub const TIMELINE_FILE: &str = "timeline.jsonl";

/// One line of the timeline index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TimelineRecord {
    /// A checkpoint node.
    Checkpoint(Checkpoint),
    /// The working tree now corresponds to `checkpoint_id`.
    Head {
        /// Checkpoint the head moved to.
        checkpoint_id: CheckpointId,
        /// When the head moved.
        at: DateTime<Utc>,
    },
}

/// In-memory view of a project's checkpoint DAG.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    nodes: HashMap<CheckpointId, Checkpoint>,
    /// Append order.
    order: Vec<CheckpointId>,
    head: Option<CheckpointId>,
}

impl Timeline {
    /// Load the index at `path`. A missing file is an empty timeline.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Timeline`] if the file exists but cannot
    /// be read.
    pub async fn load(path: &Path) -> Result<Self, CheckpointError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(CheckpointError::Timeline(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        Ok(Self::parse(&text, path))
    }

    fn parse(text: &str, path: &Path) -> Self {
        let mut timeline = Self::default();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TimelineRecord>(line) {
                Ok(record) => timeline.apply(record, index + 1),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    %err,
                    "skipping unreadable timeline record"
                ),
            }
        }
        timeline
    }

    fn apply(&mut self, record: TimelineRecord, line: usize) {
        match record {
            TimelineRecord::Checkpoint(checkpoint) => {
                if self.nodes.contains_key(&checkpoint.id) {
                    warn!(checkpoint_id = %checkpoint.id, line, "duplicate checkpoint id, keeping first");
                    return;
                }
                if let Some(parent) = &checkpoint.parent_id {
                    if !self.nodes.contains_key(parent) {
                        warn!(
                            checkpoint_id = %checkpoint.id,
                            parent_id = %parent,
                            line,
                            "checkpoint references unknown parent, skipping"
                        );
                        return;
                    }
                }
                self.order.push(checkpoint.id.clone());
                self.nodes.insert(checkpoint.id.clone(), checkpoint);
            }
            TimelineRecord::Head { checkpoint_id, .. } => {
                if self.nodes.contains_key(&checkpoint_id) {
                    self.head = Some(checkpoint_id);
                } else {
                    warn!(checkpoint_id = %checkpoint_id, line, "head references unknown checkpoint");
                }
            }
        }
    }

    /// Append `record` to the index at `path` and apply it in memory.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Timeline`] if the record cannot be
    /// serialized or durably appended.
    pub async fn append(&mut self, path: &Path, record: TimelineRecord) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|err| CheckpointError::Timeline(format!("serialize record: {err}")))?;
        line.push(b'\n');

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                CheckpointError::Timeline(format!("create {}: {err}", parent.display()))
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| CheckpointError::Timeline(format!("open {}: {err}", path.display())))?;
        if ends_torn(&mut file)
            .await
            .map_err(|err| CheckpointError::Timeline(format!("inspect {}: {err}", path.display())))?
        {
            // Terminate the torn fragment so this record gets a line of its own.
            warn!(path = %path.display(), "timeline ends with a torn record, sealing it");
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .await
            .map_err(|err| CheckpointError::Timeline(format!("append {}: {err}", path.display())))?;
        file.sync_data()
            .await
            .map_err(|err| CheckpointError::Timeline(format!("sync {}: {err}", path.display())))?;

        self.apply(record, self.order.len() + 1);
        Ok(())
    }

    /// Look up a checkpoint.
    #[must_use]
    pub fn get(&self, id: &CheckpointId) -> Option<&Checkpoint> {
        self.nodes.get(id)
    }

    /// Whether `id` is part of this timeline.
    #[must_use]
    pub fn contains(&self, id: &CheckpointId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the timeline has no checkpoints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Checkpoint the working tree last moved to.
    #[must_use]
    pub fn head(&self) -> Option<&CheckpointId> {
        self.head.as_ref()
    }

    /// Checkpoints in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Direct children of `id`. Siblings carry no meaningful order.
    #[must_use]
    pub fn children(&self, id: &CheckpointId) -> Vec<&Checkpoint> {
        self.iter()
            .filter(|node| node.parent_id.as_ref() == Some(id))
            .collect()
    }

    /// Parent chain of `id`, nearest first, excluding `id` itself.
    #[must_use]
    pub fn ancestors(&self, id: &CheckpointId) -> Vec<&Checkpoint> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.nodes.get(id).and_then(|node| node.parent_id.as_ref());
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                break;
            }
            let Some(parent) = self.nodes.get(parent_id) else {
                break;
            };
            chain.push(parent);
            cursor = parent.parent_id.as_ref();
        }
        chain
    }

    /// Checkpoints without a parent.
    #[must_use]
    pub fn roots(&self) -> Vec<&Checkpoint> {
        self.iter().filter(|node| node.parent_id.is_none()).collect()
    }

    /// Every object digest referenced by any checkpoint.
    #[must_use]
    pub fn digests(&self) -> HashSet<Digest> {
        self.nodes
            .values()
            .flat_map(|node| node.files.iter().map(|file| file.digest.clone()))
            .collect()
    }

    /// Summaries ordered by creation time, newest first.
    #[must_use]
    pub fn summaries(&self, limit: Option<usize>) -> Vec<CheckpointSummary> {
        let mut indexed: Vec<(usize, &Checkpoint)> = self.iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        indexed
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, node)| node.summary())
            .collect()
    }
}

/// Whether a non-empty index lacks its final newline.
async fn ends_torn(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}
