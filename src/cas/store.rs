//! Deduplicating, integrity-verified object storage.
//!
//! Objects live at `<root>/<2-hex>/<62-hex>`. Each file holds one codec tag
//! byte followed by the compressed content. Writes go to a temporary file in
//! the shard directory and are linked into place with `persist_noclobber`,
//! so readers never see a partial object and an existing object is never
//! overwritten.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::compress::{Compressor, Uncompressed, ZstdCompressor};
use super::digest::Digest;
use crate::errors::CasError;

/// Prefix of in-flight temporary object files.
const TEMP_PREFIX: &str = ".tmp-";

/// Content-addressed store shared by every project and session.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    writer: Arc<dyn Compressor>,
    codecs: Arc<Vec<Arc<dyn Compressor>>>,
}

impl ContentStore {
    /// Open (creating if needed) a store at `root` that writes zstd objects.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CasError> {
        Self::with_compressor(root, Arc::new(ZstdCompressor::default()))
    }

    /// Open a store that writes new objects with `compressor`.
    ///
    /// Objects written by any built-in codec remain readable.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the directory cannot be created.
    pub fn with_compressor(
        root: impl Into<PathBuf>,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Self, CasError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            CasError::Io(format!(
                "failed to create object directory {}: {err}",
                root.display()
            ))
        })?;

        let mut codecs: Vec<Arc<dyn Compressor>> = vec![Arc::clone(&compressor)];
        for builtin in [
            Arc::new(ZstdCompressor::default()) as Arc<dyn Compressor>,
            Arc::new(Uncompressed) as Arc<dyn Compressor>,
        ] {
            if codecs.iter().all(|c| c.tag() != builtin.tag()) {
                codecs.push(builtin);
            }
        }

        Ok(Self {
            root,
            writer: compressor,
            codecs: Arc::new(codecs),
        })
    }

    /// Directory holding the shard subdirectories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of `digest`.
    #[must_use]
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        object_path_in(&self.root, digest)
    }

    /// Store `content` and return its digest.
    ///
    /// Skips the write entirely when the object already exists. Safe under
    /// concurrent identical writes: the losing writer's temp file is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] on compression or filesystem failure.
    pub async fn put(&self, content: impl Into<Bytes>) -> Result<Digest, CasError> {
        let content: Bytes = content.into();
        let root = self.root.clone();
        let writer = Arc::clone(&self.writer);

        let (digest, written) =
            tokio::task::spawn_blocking(move || put_blocking(&root, writer.as_ref(), &content))
                .await
                .map_err(|err| CasError::Io(format!("put task failed: {err}")))??;

        if written {
            debug!(digest = digest.short(), "object written");
        } else {
            debug!(digest = digest.short(), "object deduplicated");
        }
        Ok(digest)
    }

    /// Load and verify the content of `digest`.
    ///
    /// # Errors
    ///
    /// - [`CasError::NotFound`] if no such object is stored.
    /// - [`CasError::Corrupted`] if the stored bytes do not decode or do not
    ///   hash back to `digest`.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>, CasError> {
        let path = self.object_path(digest);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(digest.clone()));
            }
            Err(err) => {
                return Err(CasError::Io(format!(
                    "failed to read object {}: {err}",
                    path.display()
                )));
            }
        };

        let codecs = Arc::clone(&self.codecs);
        let expected = digest.clone();
        let result = tokio::task::spawn_blocking(move || decode_object(&codecs, &expected, &raw))
            .await
            .map_err(|err| CasError::Io(format!("get task failed: {err}")))?;

        if let Err(CasError::Corrupted { ref actual, .. }) = result {
            warn!(
                digest = digest.short(),
                actual = actual.as_ref().map(Digest::short),
                "object failed verification"
            );
        }
        result
    }

    /// Whether an object with `digest` is stored.
    pub async fn has(&self, digest: &Digest) -> bool {
        tokio::fs::try_exists(self.object_path(digest))
            .await
            .unwrap_or(false)
    }

    /// Remove every stored object whose digest is not in `live`.
    ///
    /// The caller must be able to enumerate every digest still referenced,
    /// including any snapshot that is being assembled.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a shard cannot be listed or an object
    /// cannot be removed.
    pub async fn gc(&self, live: &HashSet<Digest>) -> Result<usize, CasError> {
        let root = self.root.clone();
        let live = live.clone();
        let removed = tokio::task::spawn_blocking(move || gc_blocking(&root, &live))
            .await
            .map_err(|err| CasError::Io(format!("gc task failed: {err}")))??;

        info!(removed, "content store gc complete");
        Ok(removed)
    }

    /// Number of objects currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a shard cannot be listed.
    pub async fn object_count(&self) -> Result<usize, CasError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut count = 0;
            visit_objects(&root, |_, _| {
                count += 1;
                Ok(())
            })?;
            Ok(count)
        })
        .await
        .map_err(|err| CasError::Io(format!("count task failed: {err}")))?
    }
}

fn object_path_in(root: &Path, digest: &Digest) -> PathBuf {
    let (prefix, rest) = digest.shard();
    root.join(prefix).join(rest)
}

fn put_blocking(
    root: &Path,
    compressor: &dyn Compressor,
    content: &[u8],
) -> Result<(Digest, bool), CasError> {
    let digest = Digest::of(content);
    let path = object_path_in(root, &digest);
    if path.is_file() {
        return Ok((digest, false));
    }

    let shard_dir = path
        .parent()
        .ok_or_else(|| CasError::Io("object path has no parent directory".into()))?;
    fs::create_dir_all(shard_dir).map_err(|err| {
        CasError::Io(format!(
            "failed to create shard {}: {err}",
            shard_dir.display()
        ))
    })?;

    let compressed = compressor
        .compress(content)
        .map_err(|err| CasError::Io(format!("{} compression failed: {err}", compressor.name())))?;
    let mut encoded = Vec::with_capacity(compressed.len() + 1);
    encoded.push(compressor.tag());
    encoded.extend_from_slice(&compressed);

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(shard_dir)
        .map_err(|err| CasError::Io(format!("failed to create temporary object: {err}")))?;
    tmp.write_all(&encoded)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| CasError::Io(format!("failed to write temporary object: {err}")))?;

    match tmp.persist_noclobber(&path) {
        Ok(_) => Ok((digest, true)),
        // Another writer stored the same content first.
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok((digest, false)),
        Err(err) => Err(CasError::Io(format!(
            "failed to persist object {digest}: {}",
            err.error
        ))),
    }
}

fn decode_object(
    codecs: &[Arc<dyn Compressor>],
    expected: &Digest,
    raw: &[u8],
) -> Result<Vec<u8>, CasError> {
    let corrupted = |actual| CasError::Corrupted {
        expected: expected.clone(),
        actual,
    };

    let (tag, body) = raw.split_first().ok_or_else(|| corrupted(None))?;
    let codec = codecs
        .iter()
        .find(|c| c.tag() == *tag)
        .ok_or_else(|| corrupted(None))?;
    let content = codec.decompress(body).map_err(|_| corrupted(None))?;

    let actual = Digest::of(&content);
    if actual == *expected {
        Ok(content)
    } else {
        Err(corrupted(Some(actual)))
    }
}

/// Call `visit` for every well-formed object file; temp files and strays
/// are skipped.
fn visit_objects(
    root: &Path,
    mut visit: impl FnMut(Digest, PathBuf) -> Result<(), CasError>,
) -> Result<(), CasError> {
    let shards = match fs::read_dir(root) {
        Ok(shards) => shards,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CasError::Io(format!("failed to list objects: {err}"))),
    };

    for shard in shards.flatten() {
        let shard_path = shard.path();
        if !shard_path.is_dir() {
            continue;
        }
        let prefix = shard.file_name().to_string_lossy().into_owned();
        let entries = fs::read_dir(&shard_path).map_err(|err| {
            CasError::Io(format!(
                "failed to list shard {}: {err}",
                shard_path.display()
            ))
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(digest) = format!("{prefix}{name}").parse::<Digest>() {
                visit(digest, entry.path())?;
            }
        }
    }
    Ok(())
}

fn gc_blocking(root: &Path, live: &HashSet<Digest>) -> Result<usize, CasError> {
    let mut removed = 0;
    let mut touched_shards = HashSet::new();

    visit_objects(root, |digest, path| {
        if live.contains(&digest) {
            return Ok(());
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                if let Some(shard) = path.parent() {
                    touched_shards.insert(shard.to_path_buf());
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CasError::Io(format!(
                "failed to remove object {digest}: {err}"
            ))),
        }
    })?;

    for shard in touched_shards {
        // Only succeeds once the shard is empty.
        fs::remove_dir(&shard).ok();
    }
    Ok(removed)
}
