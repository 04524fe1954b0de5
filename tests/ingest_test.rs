//! Ingestion pipeline tests: deduplication semantics and pending-file
//! hygiene across every branch.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use remora::store::{
    FsBlobStore, IndexError, IngestError, MediaIndex, MediaRecord, MediaStore, MemoryIndex,
};
use tempfile::TempDir;

async fn store_with_limit(max_upload: u64) -> (Arc<MediaStore>, Arc<MemoryIndex>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(MemoryIndex::new());
    let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
    let store = Arc::new(MediaStore::new(index.clone(), blobs, max_upload));
    (store, index, dir)
}

async fn store() -> (Arc<MediaStore>, Arc<MemoryIndex>, TempDir) {
    store_with_limit(0).await
}

/// Count regular files under a directory tree.
fn file_count(dir: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn dedup_produces_records_sharing_one_blob() {
    let (store, index, dir) = store().await;

    let mut records = Vec::new();
    for i in 0..3 {
        let record = store
            .ingest(
                &b"dedup me"[..],
                "text/plain",
                None,
                Some("@user:a.example"),
                &format!("origin{i}.example"),
                Some("media1"),
            )
            .await
            .unwrap();
        records.push(record);
    }

    assert_eq!(index.len(), 3);
    let expected_hash = "cc9b70057a93c1711e7fb822b9a0827c7b7e2a8d475743def435f67e6e5739d1";
    for record in &records {
        assert_eq!(record.content_hash, expected_hash);
        assert_eq!(record.location, records[0].location);
        assert_eq!(record.size_bytes, 8);
    }
    // Distinct identities, one physical blob.
    assert_eq!(file_count(dir.path()), 1);
}

#[tokio::test]
async fn identity_match_returns_stored_record_unaltered() {
    let (store, _index, dir) = store().await;

    let first = store
        .ingest(
            &b"payload-bytes"[..],
            "image/png",
            Some("cat.png"),
            Some("@alice:a.example"),
            "a.example",
            Some("m1"),
        )
        .await
        .unwrap();

    // Same identity, different metadata: the existing record wins.
    let second = store
        .ingest(
            &b"payload-bytes"[..],
            "image/jpeg",
            Some("other.jpg"),
            Some("@bob:a.example"),
            "a.example",
            Some("m1"),
        )
        .await
        .unwrap();

    assert_eq!(second, first);
    assert_eq!(second.content_type, "image/png");
    assert_eq!(second.upload_name.as_deref(), Some("cat.png"));
    assert_eq!(file_count(dir.path()), 1);
}

#[tokio::test]
async fn generated_id_matches_any_record_for_origin() {
    let (store, index, _dir) = store().await;

    let first = store
        .ingest(&b"same bytes"[..], "text/plain", None, None, "a.example", None)
        .await
        .unwrap();

    // No media id supplied: any same-origin duplicate is the answer.
    let second = store
        .ingest(&b"same bytes"[..], "text/plain", None, None, "a.example", None)
        .await
        .unwrap();

    assert_eq!(second.media_id, first.media_id);
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn duplicate_bytes_under_new_identity_share_the_blob() {
    let (store, _index, dir) = store().await;

    let first = store
        .ingest(
            &b"shared content"[..],
            "text/plain",
            Some("a.txt"),
            Some("@alice:a.example"),
            "a.example",
            Some("m1"),
        )
        .await
        .unwrap();

    let second = store
        .ingest(
            &b"shared content"[..],
            "application/octet-stream",
            Some("b.bin"),
            Some("@bob:b.example"),
            "b.example",
            Some("m2"),
        )
        .await
        .unwrap();

    assert_eq!(second.content_hash, first.content_hash);
    assert_eq!(second.location, first.location);
    assert_eq!(second.origin, "b.example");
    assert_eq!(second.media_id, "m2");
    assert_eq!(second.content_type, "application/octet-stream");
    assert_eq!(second.upload_name.as_deref(), Some("b.bin"));
    assert_eq!(second.user_id.as_deref(), Some("@bob:b.example"));
    assert_eq!(file_count(dir.path()), 1);
}

#[tokio::test]
async fn missing_blob_is_repaired_from_pending_upload() {
    let (store, _index, dir) = store().await;

    let record = store
        .ingest(&b"heal me"[..], "text/plain", None, None, "a.example", Some("m1"))
        .await
        .unwrap();

    std::fs::remove_file(&record.location).unwrap();
    assert_eq!(file_count(dir.path()), 0);

    let again = store
        .ingest(&b"heal me"[..], "text/plain", None, None, "a.example", Some("m1"))
        .await
        .unwrap();

    assert_eq!(again, record);
    assert!(record.location.exists());
    assert_eq!(file_count(dir.path()), 1);
}

#[tokio::test]
async fn upload_ceiling_truncates_the_stream() {
    let (store, _index, _dir) = store_with_limit(4).await;

    let record = store
        .ingest(
            &b"0123456789"[..],
            "application/octet-stream",
            None,
            None,
            "a.example",
            Some("m1"),
        )
        .await
        .unwrap();

    assert_eq!(record.size_bytes, 4);
    assert_eq!(std::fs::read(&record.location).unwrap(), b"0123");
}

#[tokio::test]
async fn losing_the_identity_race_reports_duplicate_and_cleans_up() {
    let (store, index, dir) = store().await;

    // Another writer owns (a.example, m1) with different bytes.
    index
        .insert(&MediaRecord {
            origin: "a.example".to_string(),
            media_id: "m1".to_string(),
            upload_name: None,
            content_type: "text/plain".to_string(),
            user_id: None,
            content_hash: "unrelated-hash".to_string(),
            size_bytes: 1,
            location: dir.path().join("elsewhere"),
            created_ts: 1,
        })
        .await
        .unwrap();

    let err = store
        .ingest(&b"novel bytes"[..], "text/plain", None, None, "a.example", Some("m1"))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::DuplicateRecord { .. }));
    assert_eq!(file_count(dir.path()), 0);
}

/// Index wrapper whose inserts always fail, for exercising the
/// store-error cleanup path.
struct FailingIndex(MemoryIndex);

#[async_trait]
impl MediaIndex for FailingIndex {
    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<MediaRecord>, IndexError> {
        self.0.get_by_hash(content_hash).await
    }

    async fn insert(&self, _record: &MediaRecord) -> Result<(), IndexError> {
        Err(IndexError::Backend("injected insert failure".to_string()))
    }

    async fn get(&self, origin: &str, media_id: &str) -> Result<Option<MediaRecord>, IndexError> {
        self.0.get(origin, media_id).await
    }
}

#[tokio::test]
async fn insert_failure_removes_the_pending_file() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(FailingIndex(MemoryIndex::new()));
    let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
    let store = MediaStore::new(index, blobs, 0);

    let err = store
        .ingest(&b"doomed"[..], "text/plain", None, None, "a.example", Some("m1"))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Store(_)));
    assert_eq!(file_count(dir.path()), 0);
}
