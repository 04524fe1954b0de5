//! Media metadata records and the durable index contract

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One logical piece of content visible under a specific identity.
///
/// (`origin`, `media_id`) is unique. Several records may share the same
/// `content_hash` and `location` (deduplicated bytes); a location is
/// never deleted while any record still references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Owning server name
    pub origin: String,
    /// Opaque identifier, unique per origin
    pub media_id: String,
    /// Display filename supplied at upload, if any
    pub upload_name: Option<String>,
    pub content_type: String,
    /// Uploader; absent for federated remote media
    pub user_id: Option<String>,
    /// Lowercase hex SHA-256 of the raw bytes
    pub content_hash: String,
    pub size_bytes: u64,
    /// Where the bytes live
    pub location: PathBuf,
    /// Creation time, epoch milliseconds
    pub created_ts: u64,
}

/// Identifies one in-flight or completed remote download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteFetchKey {
    pub origin: String,
    pub media_id: String,
}

impl RemoteFetchKey {
    pub fn new(origin: &str, media_id: &str) -> Self {
        Self {
            origin: origin.to_string(),
            media_id: media_id.to_string(),
        }
    }
}

impl std::fmt::Display for RemoteFetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.origin, self.media_id)
    }
}

/// Errors from the durable metadata index
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("a record already exists for {origin}/{media_id}")]
    Duplicate { origin: String, media_id: String },

    #[error("index backend error: {0}")]
    Backend(String),
}

/// The durable metadata store.
///
/// Implementations must enforce uniqueness on (`origin`, `media_id`),
/// which is the final arbiter when concurrent ingestions race, and must
/// return `get_by_hash` results ordered by `created_ts` ascending so
/// duplicate resolution is deterministic.
#[async_trait]
pub trait MediaIndex: Send + Sync {
    /// All records whose bytes hash to `content_hash`, oldest first.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Vec<MediaRecord>, IndexError>;

    /// Insert a new record. Fails with [`IndexError::Duplicate`] when
    /// (`origin`, `media_id`) is already taken.
    async fn insert(&self, record: &MediaRecord) -> Result<(), IndexError>;

    /// Look up one record by identity.
    async fn get(&self, origin: &str, media_id: &str) -> Result<Option<MediaRecord>, IndexError>;
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
