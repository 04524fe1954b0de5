//! Blob persistence
//!
//! Durable byte storage behind the [`BlobStore`] trait. The shipped
//! implementation is a filesystem store that spreads blobs over two
//! levels of fan-out directories and hashes files by streaming reads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Blob storage errors
#[derive(Error, Debug, Clone)]
pub enum BlobError {
    #[error("blob I/O error: {0}")]
    Io(String),

    #[error("blob not found: {0}")]
    NotFound(String),
}

impl BlobError {
    fn io(context: &str, err: std::io::Error) -> Self {
        BlobError::Io(format!("{context}: {err}"))
    }
}

/// Durable byte storage.
///
/// Locations are opaque to callers but are real filesystem paths in
/// this crate; the ingestion path only ever round-trips them.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream bytes into a fresh location, returning it and the number
    /// of bytes written.
    async fn persist_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(PathBuf, u64), BlobError>;

    /// Lowercase hex SHA-256 of the bytes at `location`.
    async fn hash(&self, location: &Path) -> Result<String, BlobError>;

    /// Size in bytes of the blob at `location`.
    async fn size(&self, location: &Path) -> Result<u64, BlobError>;

    /// Whether `location` currently holds bytes.
    async fn exists(&self, location: &Path) -> bool;

    /// Delete the blob at `location`.
    async fn remove(&self, location: &Path) -> Result<(), BlobError>;

    /// Move a blob between locations.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BlobError>;
}

/// Filesystem-backed blob store.
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `base_dir`, creating it if needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| BlobError::io("creating base directory", e))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn fresh_location(&self) -> PathBuf {
        let name = Uuid::new_v4().simple().to_string();
        self.base_dir.join(&name[0..2]).join(&name[2..4]).join(name)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn persist_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(PathBuf, u64), BlobError> {
        let location = self.fresh_location();
        if let Some(parent) = location.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::io("creating blob directory", e))?;
        }

        let mut file = fs::File::create(&location)
            .await
            .map_err(|e| BlobError::io("creating blob file", e))?;

        let written = match tokio::io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                // Half-written file is useless; drop it before surfacing.
                drop(file);
                let _ = fs::remove_file(&location).await;
                return Err(BlobError::io("writing blob", e));
            }
        };

        tracing::debug!(location = %location.display(), size = written, "persisted blob");
        Ok((location, written))
    }

    async fn hash(&self, location: &Path) -> Result<String, BlobError> {
        let mut file = fs::File::open(location)
            .await
            .map_err(|e| BlobError::io("opening blob for hashing", e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| BlobError::io("reading blob for hashing", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    async fn size(&self, location: &Path) -> Result<u64, BlobError> {
        let meta = fs::metadata(location)
            .await
            .map_err(|e| BlobError::io("reading blob metadata", e))?;
        Ok(meta.len())
    }

    async fn exists(&self, location: &Path) -> bool {
        fs::metadata(location).await.is_ok()
    }

    async fn remove(&self, location: &Path) -> Result<(), BlobError> {
        fs::remove_file(location)
            .await
            .map_err(|e| BlobError::io("removing blob", e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BlobError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::io("creating blob directory", e))?;
        }
        fs::rename(from, to)
            .await
            .map_err(|e| BlobError::io("renaming blob", e))
    }
}
