//! In-memory media index
//!
//! Reference [`MediaIndex`] implementation backing tests and small
//! deployments. Server embeddings are expected to supply a SQL-backed
//! index behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::record::{IndexError, MediaIndex, MediaRecord};

/// Thread-safe in-memory index keyed by (origin, media id).
#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<(String, String), MediaRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl MediaIndex for MemoryIndex {
    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<MediaRecord>, IndexError> {
        let records = self.records.read();
        let mut matches: Vec<MediaRecord> = records
            .values()
            .filter(|r| r.content_hash == content_hash)
            .cloned()
            .collect();
        // Deterministic duplicate resolution order.
        matches.sort_by_key(|r| (r.created_ts, r.origin.clone(), r.media_id.clone()));
        Ok(matches)
    }

    async fn insert(&self, record: &MediaRecord) -> Result<(), IndexError> {
        let mut records = self.records.write();
        let key = (record.origin.clone(), record.media_id.clone());
        if records.contains_key(&key) {
            return Err(IndexError::Duplicate {
                origin: record.origin.clone(),
                media_id: record.media_id.clone(),
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, origin: &str, media_id: &str) -> Result<Option<MediaRecord>, IndexError> {
        let records = self.records.read();
        Ok(records
            .get(&(origin.to_string(), media_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(origin: &str, media_id: &str, hash: &str, ts: u64) -> MediaRecord {
        MediaRecord {
            origin: origin.to_string(),
            media_id: media_id.to_string(),
            upload_name: None,
            content_type: "application/octet-stream".to_string(),
            user_id: None,
            content_hash: hash.to_string(),
            size_bytes: 4,
            location: "/tmp/blob".into(),
            created_ts: ts,
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let index = MemoryIndex::new();
        index.insert(&record("a.example", "m1", "h1", 1)).await.unwrap();

        let found = index.get("a.example", "m1").await.unwrap();
        assert_eq!(found.unwrap().media_id, "m1");
        assert!(index.get("a.example", "m2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let index = MemoryIndex::new();
        index.insert(&record("a.example", "m1", "h1", 1)).await.unwrap();

        let err = index.insert(&record("a.example", "m1", "h2", 2)).await.unwrap_err();
        assert_eq!(
            err,
            IndexError::Duplicate {
                origin: "a.example".to_string(),
                media_id: "m1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn get_by_hash_orders_by_creation() {
        let index = MemoryIndex::new();
        index.insert(&record("b.example", "m2", "h1", 20)).await.unwrap();
        index.insert(&record("a.example", "m1", "h1", 10)).await.unwrap();
        index.insert(&record("c.example", "m3", "h2", 5)).await.unwrap();

        let matches = index.get_by_hash("h1").await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].media_id, "m1");
        assert_eq!(matches[1].media_id, "m2");
    }
}
