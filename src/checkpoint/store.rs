//! Checkpoint creation, restore, branching and history queries.
//!
//! All checkpoint operations on one project are serialized by a lock keyed
//! by the canonical project root. Operations on different projects run
//! concurrently and only share the content store, which needs no lock.
//!
//! Garbage collection is the one cross-project operation. It takes the
//! store-wide gate exclusively, while snapshot, restore and branch hold it
//! shared, so an object written by a snapshot that has not reached the
//! timeline yet is never collected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};

use super::path_safety::resolve_record_path;
use super::timeline::{Timeline, TimelineRecord, TIMELINE_FILE};
use super::walker::{apply_permission_bits, relative_path, walk_project, IgnoreList, WalkedFile};
use crate::cas::{ContentStore, Digest};
use crate::errors::{CasError, CheckpointError, RestoreError};
use crate::models::checkpoint::{
    Checkpoint, CheckpointId, CheckpointSummary, DivergenceEntry, DivergenceKind, FileRecord,
    Metadata, RestoreReport,
};

/// Directory holding content objects under the store root.
pub const OBJECTS_DIR: &str = "objects";

/// Directory holding per-project timelines under the store root.
pub const PROJECTS_DIR: &str = "projects";

/// Files read and stored concurrently during a snapshot.
const SNAPSHOT_CONCURRENCY: usize = 8;

/// Hex characters of the project key.
const PROJECT_KEY_LEN: usize = 16;

/// Result of a store-wide garbage collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcReport {
    /// Digests still referenced by some timeline.
    pub live_objects: usize,
    /// Objects removed.
    pub removed_objects: usize,
    /// Timelines scanned.
    pub projects: usize,
}

#[derive(Debug, Clone, Copy)]
enum ParentChoice<'a> {
    Explicit(Option<&'a CheckpointId>),
    Head,
}

/// Snapshot, restore and branch working trees against a shared object store.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    objects: ContentStore,
    ignore: IgnoreList,
    project_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    gc_gate: RwLock<()>,
}

impl CheckpointStore {
    /// Open a store rooted at `store_root` with a zstd object store.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Cas`] if the object directory cannot be
    /// created.
    pub fn open(store_root: impl Into<PathBuf>, ignore: IgnoreList) -> Result<Self, CheckpointError> {
        let root = store_root.into();
        let objects = ContentStore::open(root.join(OBJECTS_DIR))?;
        Ok(Self::with_content_store(root, objects, ignore))
    }

    /// Build a store over an existing content store.
    #[must_use]
    pub fn with_content_store(
        store_root: impl Into<PathBuf>,
        objects: ContentStore,
        ignore: IgnoreList,
    ) -> Self {
        Self {
            root: store_root.into(),
            objects,
            ignore,
            project_locks: Mutex::new(HashMap::new()),
            gc_gate: RwLock::new(()),
        }
    }

    /// The underlying content store.
    #[must_use]
    pub fn objects(&self) -> &ContentStore {
        &self.objects
    }

    /// Location of the timeline index for `project_root`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidProjectRoot`] if the root cannot
    /// be canonicalized.
    pub fn timeline_path(&self, project_root: &Path) -> Result<PathBuf, CheckpointError> {
        let canonical = canonical_root(project_root)?;
        Ok(self.timeline_path_for(&canonical))
    }

    fn timeline_path_for(&self, canonical: &Path) -> PathBuf {
        let digest = Digest::of(canonical.to_string_lossy().as_bytes());
        let key = &digest.as_str()[..PROJECT_KEY_LEN];
        self.root.join(PROJECTS_DIR).join(key).join(TIMELINE_FILE)
    }

    fn project_lock(&self, canonical: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(canonical.to_path_buf()).or_default())
    }

    // ── Snapshot ─────────────────────────────────────────────────────────

    /// Capture `project_root` as a new checkpoint and move the head to it.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::InvalidProjectRoot`] if the root is not a directory.
    /// - [`CheckpointError::ParentNotFound`] if `parent` is not in the timeline.
    /// - [`CheckpointError::Cas`], [`CheckpointError::Io`] or
    ///   [`CheckpointError::Timeline`] on storage failure.
    pub async fn snapshot(
        &self,
        project_root: &Path,
        label: &str,
        parent: Option<&CheckpointId>,
        metadata: Metadata,
    ) -> Result<Checkpoint, CheckpointError> {
        self.snapshot_with(project_root, label, ParentChoice::Explicit(parent), metadata)
            .await
    }

    /// Like [`CheckpointStore::snapshot`], with the current head as parent.
    ///
    /// The head is read under the project lock, so concurrent calls form a
    /// chain rather than siblings.
    ///
    /// # Errors
    ///
    /// See [`CheckpointStore::snapshot`].
    pub async fn snapshot_on_head(
        &self,
        project_root: &Path,
        label: &str,
        metadata: Metadata,
    ) -> Result<Checkpoint, CheckpointError> {
        self.snapshot_with(project_root, label, ParentChoice::Head, metadata)
            .await
    }

    async fn snapshot_with(
        &self,
        project_root: &Path,
        label: &str,
        parent: ParentChoice<'_>,
        metadata: Metadata,
    ) -> Result<Checkpoint, CheckpointError> {
        let canonical = canonical_root(project_root)?;
        let span = info_span!("snapshot", project = %canonical.display(), label);
        async {
            let _gate = self.gc_gate.read().await;
            let lock = self.project_lock(&canonical);
            let _guard = lock.lock().await;

            let path = self.timeline_path_for(&canonical);
            let mut timeline = Timeline::load(&path).await?;
            let parent = match parent {
                ParentChoice::Explicit(parent) => parent.cloned(),
                ParentChoice::Head => timeline.head().cloned(),
            };
            self.snapshot_locked(&canonical, &path, &mut timeline, label, parent.as_ref(), metadata)
                .await
        }
        .instrument(span)
        .await
    }

    async fn snapshot_locked(
        &self,
        canonical: &Path,
        timeline_path: &Path,
        timeline: &mut Timeline,
        label: &str,
        parent: Option<&CheckpointId>,
        metadata: Metadata,
    ) -> Result<Checkpoint, CheckpointError> {
        if let Some(parent) = parent {
            if !timeline.contains(parent) {
                return Err(CheckpointError::ParentNotFound(parent.clone()));
            }
        }

        let walked = self.walk(canonical).await?;
        let objects = &self.objects;
        let records: Vec<FileRecord> = stream::iter(walked)
            .map(|file| store_file(objects, file))
            .buffered(SNAPSHOT_CONCURRENCY)
            .try_filter_map(|record| async move { Ok(record) })
            .try_collect()
            .await?;

        let checkpoint = Checkpoint::new(label.to_owned(), parent.cloned(), records, metadata);
        timeline
            .append(timeline_path, TimelineRecord::Checkpoint(checkpoint.clone()))
            .await?;
        timeline
            .append(
                timeline_path,
                TimelineRecord::Head {
                    checkpoint_id: checkpoint.id.clone(),
                    at: checkpoint.created_at,
                },
            )
            .await?;

        info!(
            checkpoint_id = %checkpoint.id,
            files = checkpoint.files.len(),
            total_bytes = checkpoint.total_bytes(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    async fn walk(&self, canonical: &Path) -> Result<Vec<WalkedFile>, CheckpointError> {
        let root = canonical.to_path_buf();
        let ignore = self.ignore.clone();
        tokio::task::spawn_blocking(move || walk_project(&root, &ignore))
            .await
            .map_err(|err| CheckpointError::Io(format!("walk task failed: {err}")))?
    }

    // ── Restore ──────────────────────────────────────────────────────────

    /// Replace the contents of `project_root` with checkpoint `checkpoint_id`.
    ///
    /// The checkpoint is looked up in `project_root`'s own timeline, so an id
    /// recorded for another project is [`RestoreError::CheckpointNotFound`].
    ///
    /// Files the checkpoint does not contain are deleted; ignored paths are
    /// never touched. With `create_backup`, the current tree is snapshotted
    /// first so the restore itself can be undone.
    ///
    /// A failure part-way through leaves the tree partially updated; the
    /// error carries the work completed so far.
    ///
    /// # Errors
    ///
    /// See [`RestoreError`].
    pub async fn restore(
        &self,
        checkpoint_id: &CheckpointId,
        project_root: &Path,
        create_backup: bool,
    ) -> Result<RestoreReport, RestoreError> {
        let canonical = canonical_root(project_root).map_err(|err| RestoreError::Io {
            message: err.to_string(),
            partial: RestoreReport::default(),
        })?;
        let span = info_span!("restore", checkpoint_id = %checkpoint_id, project_root = %canonical.display());
        async {
            let _gate = self.gc_gate.read().await;
            let lock = self.project_lock(&canonical);
            let _guard = lock.lock().await;
            self.restore_locked(checkpoint_id, &canonical, create_backup)
                .await
        }
        .instrument(span)
        .await
    }

    async fn restore_locked(
        &self,
        checkpoint_id: &CheckpointId,
        canonical: &Path,
        create_backup: bool,
    ) -> Result<RestoreReport, RestoreError> {
        let timeline_path = self.timeline_path_for(canonical);
        let mut timeline = Timeline::load(&timeline_path)
            .await
            .map_err(|err| io_failure(err.to_string(), RestoreReport::default()))?;
        let checkpoint = timeline
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| RestoreError::CheckpointNotFound(checkpoint_id.clone()))?;

        // Refuse unsafe paths before touching anything.
        let mut targets = Vec::with_capacity(checkpoint.files.len());
        for record in &checkpoint.files {
            let target = resolve_record_path(canonical, &record.path).map_err(|reason| {
                warn!(path = record.path.as_str(), %reason, "refusing unsafe restore path");
                RestoreError::PathViolation {
                    path: record.path.clone(),
                    partial: RestoreReport::default(),
                }
            })?;
            targets.push(target);
        }

        let mut report = RestoreReport {
            checkpoint_id: Some(checkpoint.id.clone()),
            ..RestoreReport::default()
        };

        if create_backup {
            let mut metadata = Metadata::new();
            metadata.insert("trigger".into(), "pre_restore".into());
            metadata.insert("restoring".into(), checkpoint.id.as_str().into());
            let parent = timeline.head().cloned();
            let backup = self
                .snapshot_locked(
                    canonical,
                    &timeline_path,
                    &mut timeline,
                    &format!("pre-restore backup before {}", checkpoint.label),
                    parent.as_ref(),
                    metadata,
                )
                .await
                .map_err(RestoreError::Backup)?;
            report.backup_checkpoint_id = Some(backup.id);
        }

        for (record, target) in checkpoint.files.iter().zip(&targets) {
            self.restore_file(canonical, record, target, &mut report)
                .await?;
        }

        self.delete_extraneous(canonical, &checkpoint, &mut report)
            .await?;

        timeline
            .append(
                &timeline_path,
                TimelineRecord::Head {
                    checkpoint_id: checkpoint.id.clone(),
                    at: chrono::Utc::now(),
                },
            )
            .await
            .map_err(|err| io_failure(err.to_string(), report.clone()))?;

        info!(
            written = report.files_written,
            unchanged = report.files_unchanged,
            deleted = report.files_deleted,
            backup = report.backup_checkpoint_id.as_ref().map(CheckpointId::as_str),
            "checkpoint restored"
        );
        Ok(report)
    }

    async fn restore_file(
        &self,
        canonical: &Path,
        record: &FileRecord,
        target: &Path,
        report: &mut RestoreReport,
    ) -> Result<(), RestoreError> {
        if let Ok(existing) = tokio::fs::symlink_metadata(target).await {
            if existing.is_file() {
                if let Ok(current) = tokio::fs::read(target).await {
                    if Digest::of(&current) == record.digest {
                        apply_permission_bits(target, record.mode)
                            .map_err(|err| io_failure(format!("chmod {}: {err}", record.path), report.clone()))?;
                        report.files_unchanged += 1;
                        return Ok(());
                    }
                }
            }
        }

        let content = self.objects.get(&record.digest).await.map_err(|err| match err {
            CasError::NotFound(digest) => RestoreError::MissingObject {
                digest,
                path: record.path.clone(),
                partial: report.clone(),
            },
            source @ CasError::Corrupted { .. } => RestoreError::Corrupted {
                source,
                path: record.path.clone(),
                partial: report.clone(),
            },
            other => io_failure(other.to_string(), report.clone()),
        })?;

        let root = canonical.to_path_buf();
        let path = target.to_path_buf();
        let mode = record.mode;
        tokio::task::spawn_blocking(move || write_restored_file(&root, &path, &content, mode))
            .await
            .map_err(|err| io_failure(format!("write task failed: {err}"), report.clone()))?
            .map_err(|err| io_failure(format!("write {}: {err}", record.path), report.clone()))?;

        debug!(path = record.path.as_str(), digest = record.digest.short(), "file restored");
        report.files_written += 1;
        Ok(())
    }

    async fn delete_extraneous(
        &self,
        canonical: &Path,
        checkpoint: &Checkpoint,
        report: &mut RestoreReport,
    ) -> Result<(), RestoreError> {
        let present = self
            .walk(canonical)
            .await
            .map_err(|err| io_failure(err.to_string(), report.clone()))?;
        let wanted: HashSet<&str> = checkpoint.files.iter().map(|f| f.path.as_str()).collect();

        let mut emptied_dirs = HashSet::new();
        for file in present {
            if wanted.contains(file.relative.as_str()) {
                continue;
            }
            match tokio::fs::remove_file(&file.absolute).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(io_failure(
                        format!("delete {}: {err}", file.relative),
                        report.clone(),
                    ));
                }
            }
            debug!(path = file.relative.as_str(), "file deleted");
            report.files_deleted += 1;
            if let Some(parent) = file.absolute.parent() {
                emptied_dirs.insert(parent.to_path_buf());
            }
        }

        // Prune directories left empty, deepest first, never the root.
        let mut dirs: Vec<PathBuf> = emptied_dirs.into_iter().collect();
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            for ancestor in dir.ancestors() {
                if ancestor == canonical || !ancestor.starts_with(canonical) {
                    break;
                }
                if relative_path(canonical, ancestor).is_some_and(|rel| self.ignore.is_ignored(&rel)) {
                    break;
                }
                if tokio::fs::remove_dir(ancestor).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Branch ───────────────────────────────────────────────────────────

    /// Create a child of `checkpoint_id` sharing its file set.
    ///
    /// No content is copied and the head does not move.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if the checkpoint is not in the
    /// project's timeline, or [`CheckpointError::Timeline`] on append failure.
    pub async fn branch(
        &self,
        project_root: &Path,
        checkpoint_id: &CheckpointId,
        label: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let canonical = canonical_root(project_root)?;
        let span = info_span!("branch", checkpoint_id = %checkpoint_id, label);
        async {
            let _gate = self.gc_gate.read().await;
            let lock = self.project_lock(&canonical);
            let _guard = lock.lock().await;

            let path = self.timeline_path_for(&canonical);
            let mut timeline = Timeline::load(&path).await?;
            let source = timeline
                .get(checkpoint_id)
                .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

            let mut metadata = source.metadata.clone();
            metadata.insert("branched_from".into(), source.id.as_str().into());
            let branch = Checkpoint::new(
                label.to_owned(),
                Some(source.id.clone()),
                source.files.clone(),
                metadata,
            );
            timeline
                .append(&path, TimelineRecord::Checkpoint(branch.clone()))
                .await?;

            info!(branch_id = %branch.id, "checkpoint branched");
            Ok::<_, CheckpointError>(branch)
        }
        .instrument(span)
        .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Load the timeline of `project_root`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidProjectRoot`] or
    /// [`CheckpointError::Timeline`].
    pub async fn timeline(&self, project_root: &Path) -> Result<Timeline, CheckpointError> {
        let canonical = canonical_root(project_root)?;
        Timeline::load(&self.timeline_path_for(&canonical)).await
    }

    /// Summaries of the project's checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// See [`CheckpointStore::timeline`].
    pub async fn list(
        &self,
        project_root: &Path,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        Ok(self.timeline(project_root).await?.summaries(limit))
    }

    /// Fetch one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if it is not in the timeline.
    pub async fn get(
        &self,
        project_root: &Path,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint, CheckpointError> {
        self.timeline(project_root)
            .await?
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))
    }

    /// Paths that differ going from checkpoint `from` to checkpoint `to`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if either checkpoint is unknown.
    pub async fn diff(
        &self,
        project_root: &Path,
        from: &CheckpointId,
        to: &CheckpointId,
    ) -> Result<Vec<DivergenceEntry>, CheckpointError> {
        let timeline = self.timeline(project_root).await?;
        let left = timeline
            .get(from)
            .ok_or_else(|| CheckpointError::NotFound(from.clone()))?;
        let right = timeline
            .get(to)
            .ok_or_else(|| CheckpointError::NotFound(to.clone()))?;
        Ok(find_divergences(&file_digests(left), &file_digests(right)))
    }

    /// Paths in the live tree that differ from checkpoint `checkpoint_id`.
    ///
    /// Hashes the working tree without storing anything.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if the checkpoint is unknown,
    /// or [`CheckpointError::Io`] if the tree cannot be read.
    pub async fn divergence(
        &self,
        project_root: &Path,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<DivergenceEntry>, CheckpointError> {
        let checkpoint = self.get(project_root, checkpoint_id).await?;
        let canonical = canonical_root(project_root)?;

        let mut current = BTreeMap::new();
        for file in self.walk(&canonical).await? {
            match tokio::fs::read(&file.absolute).await {
                Ok(content) => {
                    current.insert(file.relative, Digest::of(&content));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CheckpointError::Io(format!("read {}: {err}", file.relative)));
                }
            }
        }

        let divergences = find_divergences(&file_digests(&checkpoint), &current);
        if divergences.is_empty() {
            info!(checkpoint_id = %checkpoint_id, "no file divergences detected");
        } else {
            info!(
                checkpoint_id = %checkpoint_id,
                diverged_count = divergences.len(),
                "file divergences detected"
            );
        }
        Ok(divergences)
    }

    // ── Garbage collection ───────────────────────────────────────────────

    /// Remove every object no timeline references.
    ///
    /// Blocks new snapshot, restore and branch calls for its duration.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Timeline`] if any timeline cannot be read
    /// (nothing is removed in that case), or [`CheckpointError::Cas`] on
    /// removal failure.
    pub async fn collect_garbage(&self) -> Result<GcReport, CheckpointError> {
        let span = info_span!("collect_garbage", store = %self.root.display());
        async {
            let _gate = self.gc_gate.write().await;

            let mut live = HashSet::new();
            let mut projects = 0;
            let projects_dir = self.root.join(PROJECTS_DIR);
            match tokio::fs::read_dir(&projects_dir).await {
                Ok(mut entries) => {
                    while let Some(entry) = entries
                        .next_entry()
                        .await
                        .map_err(|err| CheckpointError::Timeline(format!("list projects: {err}")))?
                    {
                        let path = entry.path().join(TIMELINE_FILE);
                        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                            continue;
                        }
                        live.extend(Timeline::load(&path).await?.digests());
                        projects += 1;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CheckpointError::Timeline(format!(
                        "list {}: {err}",
                        projects_dir.display()
                    )));
                }
            }

            let removed_objects = self.objects.gc(&live).await?;
            let report = GcReport {
                live_objects: live.len(),
                removed_objects,
                projects,
            };
            info!(
                live = report.live_objects,
                removed = report.removed_objects,
                projects = report.projects,
                "garbage collection complete"
            );
            Ok::<_, CheckpointError>(report)
        }
        .instrument(span)
        .await
    }
}

fn canonical_root(project_root: &Path) -> Result<PathBuf, CheckpointError> {
    let canonical = project_root
        .canonicalize()
        .map_err(|_| CheckpointError::InvalidProjectRoot(project_root.to_path_buf()))?;
    if canonical.is_dir() {
        Ok(canonical)
    } else {
        Err(CheckpointError::InvalidProjectRoot(project_root.to_path_buf()))
    }
}

/// Read one walked file and store it. A file that vanished since the walk
/// is left out of the snapshot.
async fn store_file(
    objects: &ContentStore,
    file: WalkedFile,
) -> Result<Option<FileRecord>, CheckpointError> {
    let content = match tokio::fs::read(&file.absolute).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = file.relative.as_str(), "file vanished during snapshot");
            return Ok(None);
        }
        Err(err) => {
            return Err(CheckpointError::Io(format!("read {}: {err}", file.relative)));
        }
    };
    let size = content.len() as u64;
    let digest = objects.put(content).await?;
    Ok(Some(FileRecord {
        path: file.relative,
        digest,
        size,
        mode: file.mode,
    }))
}

/// Write `content` to `path` atomically, replacing whatever is in the way.
fn write_restored_file(root: &Path, path: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("file path has no parent directory"))?;
    ensure_directory(root, parent)?;

    if let Ok(existing) = std::fs::symlink_metadata(path) {
        if existing.is_dir() {
            std::fs::remove_dir_all(path)?;
        }
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    apply_permission_bits(path, mode)
}

/// Create `dir` and its ancestors below `root`, removing any non-directory
/// entry that sits where a directory is needed.
fn ensure_directory(root: &Path, dir: &Path) -> std::io::Result<()> {
    let Ok(relative) = dir.strip_prefix(root) else {
        return Err(std::io::Error::other("directory outside the target root"));
    };
    let mut current = root.to_path_buf();
    for part in relative.components() {
        current.push(part);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            // Symlinked directories were validated to resolve inside root.
            Ok(meta) if meta.file_type().is_symlink() && current.is_dir() => {}
            Ok(_) => {
                std::fs::remove_file(&current)?;
                std::fs::create_dir(&current)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&current)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn io_failure(message: String, partial: RestoreReport) -> RestoreError {
    RestoreError::Io { message, partial }
}

fn file_digests(checkpoint: &Checkpoint) -> BTreeMap<String, Digest> {
    checkpoint
        .files
        .iter()
        .map(|file| (file.path.clone(), file.digest.clone()))
        .collect()
}

/// Compare two path → digest maps. The result is sorted by path.
fn find_divergences(
    before: &BTreeMap<String, Digest>,
    after: &BTreeMap<String, Digest>,
) -> Vec<DivergenceEntry> {
    let mut diverged = Vec::new();

    for (file, old_digest) in before {
        match after.get(file) {
            Some(new_digest) if new_digest != old_digest => diverged.push(DivergenceEntry {
                file_path: file.clone(),
                kind: DivergenceKind::Modified,
            }),
            None => diverged.push(DivergenceEntry {
                file_path: file.clone(),
                kind: DivergenceKind::Deleted,
            }),
            _ => {}
        }
    }

    for file in after.keys() {
        if !before.contains_key(file) {
            diverged.push(DivergenceEntry {
                file_path: file.clone(),
                kind: DivergenceKind::Added,
            });
        }
    }

    diverged.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    diverged
}
