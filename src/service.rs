//! Media service facade
//!
//! Wires the address policy, fetcher, store, and download handler
//! together and exposes the operations an API layer consumes: local
//! upload, direct lookup, and remote retrieval.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::config::RepoConfig;
use crate::net::{AddressPolicy, PolicyError, SafeFetcher, SafeResolver};
use crate::remote::{DownloadResult, RemoteError, ResourceHandler};
use crate::store::{BlobStore, IndexError, IngestError, MediaIndex, MediaRecord, MediaStore};

/// Front door for media operations.
pub struct MediaService {
    config: RepoConfig,
    index: Arc<dyn MediaIndex>,
    store: Arc<MediaStore>,
    handler: Arc<ResourceHandler>,
}

impl MediaService {
    /// Build a service from configuration and the two storage seams.
    /// Fails only when the configured network policy cannot be parsed.
    pub fn new(
        config: RepoConfig,
        index: Arc<dyn MediaIndex>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, PolicyError> {
        let policy = AddressPolicy::from_config(&config.network)?;
        let resolver = Arc::new(SafeResolver::new(policy));
        let fetcher = SafeFetcher::new(resolver, config.remote.clone());
        let store = Arc::new(MediaStore::new(
            index.clone(),
            blobs,
            config.uploads.max_size_bytes,
        ));
        let handler = Arc::new(ResourceHandler::new(
            fetcher,
            store.clone(),
            config.remote.insecure_http,
        ));
        Ok(Self {
            config,
            index,
            store,
            handler,
        })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        &self.store
    }

    pub fn handler(&self) -> &Arc<ResourceHandler> {
        &self.handler
    }

    /// Direct index lookup; no fetch is triggered.
    pub async fn get_media(
        &self,
        origin: &str,
        media_id: &str,
    ) -> Result<Option<MediaRecord>, IndexError> {
        self.index.get(origin, media_id).await
    }

    /// Fetch media served by a remote origin, downloading (coalesced)
    /// on a local miss.
    pub async fn get_remote_media(&self, origin: &str, media_id: &str) -> DownloadResult {
        match self.index.get(origin, media_id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => self.handler.download(origin, media_id).await,
            Err(e) => Err(RemoteError::Store(e.to_string())),
        }
    }

    /// Ingest a local upload under a freshly generated media id.
    pub async fn upload_media<R>(
        &self,
        reader: R,
        content_type: &str,
        filename: Option<&str>,
        user_id: Option<&str>,
        origin: &str,
    ) -> Result<MediaRecord, IngestError>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.store
            .ingest(reader, content_type, filename, user_id, origin, None)
            .await
    }

    /// Pre-stream ceiling check against a known length or a raw
    /// `Content-Length` header. An unparseable header counts as too
    /// large; an absent one cannot be judged.
    pub fn is_too_large(&self, content_length: Option<u64>, header: Option<&str>) -> bool {
        let max = self.config.uploads.max_size_bytes;
        if max == 0 {
            return false;
        }
        if let Some(length) = content_length {
            return length > max;
        }
        if let Some(header) = header.filter(|h| !h.is_empty()) {
            return match header.parse::<u64>() {
                Ok(length) => length > max,
                Err(_) => {
                    tracing::warn!(header = %header, "unparseable content length; treating as too large");
                    true
                }
            };
        }
        false
    }
}
