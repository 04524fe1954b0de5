//! Content-addressed ingestion
//!
//! [`MediaStore::ingest`] is the single write path for media bytes,
//! local uploads and federated downloads alike. Bytes are staged to a
//! pending blob, hashed, and then either promoted as a novel object,
//! matched to an existing identity, or attached as a new identity
//! sharing an existing blob. The pending blob is resolved on every
//! exit path; it never outlives the call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::blob::BlobStore;
use super::record::{now_millis, IndexError, MediaIndex, MediaRecord};

/// Ingestion errors
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("failed to persist upload: {0}")]
    Persistence(String),

    #[error("metadata store failure: {0}")]
    Store(String),

    #[error("a record already exists for {origin}/{media_id}")]
    DuplicateRecord { origin: String, media_id: String },
}

impl From<IndexError> for IngestError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Duplicate { origin, media_id } => {
                IngestError::DuplicateRecord { origin, media_id }
            }
            IndexError::Backend(message) => IngestError::Store(message),
        }
    }
}

/// Staged upload bytes, exclusively owned by the ingestion call that
/// created them. Dropped unresolved, the file is removed.
struct PendingUpload {
    location: PathBuf,
    resolved: bool,
}

impl PendingUpload {
    fn new(location: PathBuf) -> Self {
        Self {
            location,
            resolved: false,
        }
    }

    fn location(&self) -> &Path {
        &self.location
    }

    /// The pending blob becomes the record's permanent location.
    fn promote(mut self) -> PathBuf {
        self.resolved = true;
        std::mem::take(&mut self.location)
    }

    /// The bytes are no longer needed; delete them.
    async fn discard(mut self, blobs: &dyn BlobStore) {
        self.resolved = true;
        if let Err(e) = blobs.remove(&self.location).await {
            tracing::warn!(
                location = %self.location.display(),
                error = %e,
                "failed to remove pending upload"
            );
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        // Backstop for early returns; the normal paths resolve first.
        if !self.resolved {
            let _ = std::fs::remove_file(&self.location);
        }
    }
}

/// The content-addressed media store.
pub struct MediaStore {
    index: Arc<dyn MediaIndex>,
    blobs: Arc<dyn BlobStore>,
    max_upload_bytes: u64,
}

impl MediaStore {
    /// `max_upload_bytes` of 0 disables the upload ceiling.
    pub fn new(index: Arc<dyn MediaIndex>, blobs: Arc<dyn BlobStore>, max_upload_bytes: u64) -> Self {
        Self {
            index,
            blobs,
            max_upload_bytes,
        }
    }

    pub fn index(&self) -> &Arc<dyn MediaIndex> {
        &self.index
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Ingest a byte stream under (`origin`, `media_id`).
    ///
    /// Without a caller-supplied `media_id` a fresh opaque id is
    /// generated, which also loosens duplicate matching to "any record
    /// this origin already has for these bytes". The input is truncated
    /// at the configured upload ceiling; declared sizes are never
    /// trusted.
    pub async fn ingest<R>(
        &self,
        reader: R,
        content_type: &str,
        filename: Option<&str>,
        user_id: Option<&str>,
        origin: &str,
        media_id: Option<&str>,
    ) -> Result<MediaRecord, IngestError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let (media_id, generated) = match media_id {
            Some(id) => (id.to_string(), false),
            None => (generate_media_id(), true),
        };

        tracing::debug!(
            origin = %origin,
            media_id = %media_id,
            generated_id = generated,
            "ingesting media"
        );

        let mut limited: Box<dyn AsyncRead + Send + Unpin> = if self.max_upload_bytes > 0 {
            Box::new(reader.take(self.max_upload_bytes))
        } else {
            Box::new(reader)
        };

        let (location, written) = self
            .blobs
            .persist_stream(&mut *limited)
            .await
            .map_err(|e| IngestError::Persistence(e.to_string()))?;
        let pending = PendingUpload::new(location);

        let hash = match self.blobs.hash(pending.location()).await {
            Ok(hash) => hash,
            Err(e) => {
                let message = e.to_string();
                pending.discard(self.blobs.as_ref()).await;
                return Err(IngestError::Persistence(message));
            }
        };

        let duplicates = match self.index.get_by_hash(&hash).await {
            Ok(records) => records,
            Err(e) => {
                let message = e.to_string();
                pending.discard(self.blobs.as_ref()).await;
                return Err(IngestError::Store(message));
            }
        };

        if let Some(basis) = duplicates.last().cloned() {
            // Existing identity wins over whatever the caller sent.
            for existing in &duplicates {
                if existing.origin == origin && (existing.media_id == media_id || generated) {
                    if existing.content_type != content_type
                        || existing.user_id.as_deref() != user_id
                        || existing.upload_name.as_deref() != filename
                    {
                        tracing::warn!(
                            origin = %origin,
                            media_id = %existing.media_id,
                            "identity match with differing metadata; returning stored record unaltered"
                        );
                    } else {
                        tracing::debug!(
                            origin = %origin,
                            media_id = %existing.media_id,
                            "identity match; returning stored record"
                        );
                    }
                    self.resolve_against(pending, &existing.location).await;
                    return Ok(existing.clone());
                }
            }

            // Same bytes under a new identity: reuse the blob, write a
            // fresh metadata record based on the last duplicate.
            tracing::debug!(origin = %origin, media_id = %media_id, "duplicate hash; attaching new record to existing blob");
            let record = MediaRecord {
                origin: origin.to_string(),
                media_id,
                upload_name: filename.map(str::to_string),
                content_type: content_type.to_string(),
                user_id: user_id.map(str::to_string),
                content_hash: basis.content_hash,
                size_bytes: basis.size_bytes,
                location: basis.location,
                created_ts: now_millis(),
            };
            return match self.index.insert(&record).await {
                Ok(()) => {
                    self.resolve_against(pending, &record.location).await;
                    Ok(record)
                }
                Err(e) => {
                    pending.discard(self.blobs.as_ref()).await;
                    Err(e.into())
                }
            };
        }

        // Novel content: the pending blob is promoted in place.
        tracing::debug!(origin = %origin, media_id = %media_id, size = written, "persisting novel media record");
        let record = MediaRecord {
            origin: origin.to_string(),
            media_id,
            upload_name: filename.map(str::to_string),
            content_type: content_type.to_string(),
            user_id: user_id.map(str::to_string),
            content_hash: hash,
            size_bytes: written,
            location: pending.location().to_path_buf(),
            created_ts: now_millis(),
        };
        match self.index.insert(&record).await {
            Ok(()) => {
                let _ = pending.promote();
                Ok(record)
            }
            Err(e) => {
                pending.discard(self.blobs.as_ref()).await;
                Err(e.into())
            }
        }
    }

    /// Reconcile a pending blob with a record's permanent location: if
    /// the target already holds bytes the pending copy is redundant;
    /// if the blob went missing the pending copy repairs it.
    async fn resolve_against(&self, pending: PendingUpload, target: &Path) {
        if self.blobs.exists(target).await {
            pending.discard(self.blobs.as_ref()).await;
            return;
        }
        tracing::warn!(target = %target.display(), "stored blob missing; repairing from pending upload");
        let source = pending.promote();
        if let Err(e) = self.blobs.rename(&source, target).await {
            tracing::error!(
                source = %source.display(),
                target = %target.display(),
                error = %e,
                "failed to repair missing blob"
            );
            let _ = self.blobs.remove(&source).await;
        }
    }
}

/// Opaque, effectively collision-free media identifier.
fn generate_media_id() -> String {
    Uuid::new_v4().simple().to_string()
}
