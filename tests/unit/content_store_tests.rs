//! Unit tests for the content-addressed store.

use std::collections::HashSet;
use std::sync::Arc;

use agent_timeline::cas::{ContentStore, Digest, Uncompressed};
use agent_timeline::errors::CasError;

fn open_store() -> (tempfile::TempDir, ContentStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ContentStore::open(temp.path().join("objects")).expect("open store");
    (temp, store)
}

// ── Digest ────────────────────────────────────────────────────────────────────

#[test]
fn digest_is_sha256_hex_of_uncompressed_bytes() {
    let digest = Digest::of(b"hello");
    assert_eq!(
        digest.as_str(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
}

#[test]
fn digest_parse_rejects_invalid_text() {
    assert!(matches!(
        "ABC".parse::<Digest>(),
        Err(CasError::InvalidDigest(_))
    ));
    let upper = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";
    assert!(upper.parse::<Digest>().is_err(), "uppercase hex is not canonical");
}

// ── Put / get ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_then_get_returns_original_bytes() {
    let (_temp, store) = open_store();
    let content = b"fn main() { println!(\"hi\"); }\n".repeat(64);

    let digest = store.put(content.clone()).await.expect("put");
    assert_eq!(digest, Digest::of(&content));
    assert!(store.has(&digest).await);
    assert_eq!(store.get(&digest).await.expect("get"), content);
}

#[tokio::test]
async fn objects_are_sharded_by_digest_prefix() {
    let (_temp, store) = open_store();
    let digest = store.put(b"sharded".to_vec()).await.expect("put");

    let path = store.object_path(&digest);
    assert!(path.is_file());
    let file_name = path.file_name().and_then(|n| n.to_str()).expect("file name");
    let shard = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .expect("shard");
    assert_eq!(shard, &digest.as_str()[..2]);
    assert_eq!(file_name, &digest.as_str()[2..]);
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let (_temp, store) = open_store();

    let first = store.put(b"same".to_vec()).await.expect("first put");
    let second = store.put(b"same".to_vec()).await.expect("second put");

    assert_eq!(first, second);
    assert_eq!(store.object_count().await.expect("count"), 1);
}

#[tokio::test]
async fn concurrent_identical_puts_do_not_corrupt() {
    let (_temp, store) = open_store();
    let content = vec![7_u8; 256 * 1024];

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let content = content.clone();
        handles.push(tokio::spawn(async move { store.put(content).await }));
    }

    let mut digests = HashSet::new();
    for handle in handles {
        digests.insert(handle.await.expect("join").expect("put"));
    }

    assert_eq!(digests.len(), 1);
    let digest = digests.into_iter().next().expect("digest");
    assert_eq!(store.get(&digest).await.expect("get"), content);
    assert_eq!(store.object_count().await.expect("count"), 1);
}

#[tokio::test]
async fn empty_content_is_storable() {
    let (_temp, store) = open_store();
    let digest = store.put(Vec::new()).await.expect("put");
    assert!(store.get(&digest).await.expect("get").is_empty());
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_object_is_not_found() {
    let (_temp, store) = open_store();
    let digest = Digest::of(b"never stored");

    assert!(!store.has(&digest).await);
    assert!(matches!(store.get(&digest).await, Err(CasError::NotFound(d)) if d == digest));
}

#[tokio::test]
async fn tampered_object_is_corrupted() {
    let (_temp, store) = open_store();
    let digest = store.put(b"original".to_vec()).await.expect("put");

    // Valid uncompressed framing, wrong content.
    let mut tampered = vec![Uncompressed::TAG];
    tampered.extend_from_slice(b"tampered");
    std::fs::write(store.object_path(&digest), tampered).expect("overwrite object");

    match store.get(&digest).await {
        Err(CasError::Corrupted { expected, actual }) => {
            assert_eq!(expected, digest);
            assert_eq!(actual, Some(Digest::of(b"tampered")));
        }
        other => panic!("expected Corrupted, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_object_is_corrupted() {
    let (_temp, store) = open_store();
    let digest = store.put(b"original".to_vec()).await.expect("put");

    std::fs::write(store.object_path(&digest), b"zgarbage").expect("overwrite object");

    assert!(matches!(
        store.get(&digest).await,
        Err(CasError::Corrupted { actual: None, .. })
    ));
}

// ── Codecs ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn objects_stay_readable_after_changing_compressor() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("objects");

    let raw = ContentStore::with_compressor(&root, Arc::new(Uncompressed)).expect("raw store");
    let digest = raw.put(b"written raw".to_vec()).await.expect("put");

    let zstd = ContentStore::open(&root).expect("zstd store");
    assert_eq!(zstd.get(&digest).await.expect("get"), b"written raw");
}

// ── GC ────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn gc_removes_only_unreferenced_objects() {
    let (_temp, store) = open_store();
    let keep = store.put(b"keep".to_vec()).await.expect("put keep");
    let drop = store.put(b"drop".to_vec()).await.expect("put drop");

    let live: HashSet<Digest> = [keep.clone()].into_iter().collect();
    let removed = store.gc(&live).await.expect("gc");

    assert_eq!(removed, 1);
    assert!(store.has(&keep).await);
    assert!(!store.has(&drop).await);
    assert_eq!(store.object_count().await.expect("count"), 1);
}

#[tokio::test]
async fn gc_on_empty_store_removes_nothing() {
    let (_temp, store) = open_store();
    assert_eq!(store.gc(&HashSet::new()).await.expect("gc"), 0);
}
