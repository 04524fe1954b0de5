//! Coalesced remote media downloads
//!
//! Concurrent requests for the same (origin, media id) share one
//! outbound fetch. The registry of in-flight downloads is the only
//! shared mutable state here; its critical sections are map operations
//! only and never span the fetch itself. Every waiter observes the one
//! result the initiator produced, success or failure alike.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;

use crate::net::{FetchError, SafeFetcher};
use crate::store::{IngestError, MediaRecord, MediaStore, RemoteFetchKey};

/// Remote download errors, broadcast identically to every waiter
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("remote media {0} not found")]
    NotFound(RemoteFetchKey),

    #[error("metadata store failure: {0}")]
    Store(String),

    #[error("download interrupted before a result was delivered")]
    Interrupted,
}

/// The shared outcome of one coalesced download.
pub type DownloadResult = Result<MediaRecord, RemoteError>;

type Registry = Mutex<HashMap<RemoteFetchKey, Vec<oneshot::Sender<DownloadResult>>>>;

/// Singleflight handler for federated media downloads.
pub struct ResourceHandler {
    registry: Registry,
    fetcher: SafeFetcher,
    store: Arc<MediaStore>,
    insecure_http: bool,
}

impl ResourceHandler {
    pub fn new(fetcher: SafeFetcher, store: Arc<MediaStore>, insecure_http: bool) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            fetcher,
            store,
            insecure_http,
        }
    }

    /// Download remote media, joining an in-flight fetch for the same
    /// key when one exists. At most one outbound fetch per key is ever
    /// in flight.
    pub async fn download(&self, origin: &str, media_id: &str) -> DownloadResult {
        let key = RemoteFetchKey::new(origin, media_id);

        let waiter = {
            let mut registry = self.registry.lock();
            match registry.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    registry.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            tracing::debug!(key = %key, "joining in-flight download");
            return rx.await.unwrap_or(Err(RemoteError::Interrupted));
        }

        let guard = BroadcastGuard {
            registry: &self.registry,
            key: Some(key),
        };
        let result = self.fetch_and_ingest(origin, media_id).await;
        guard.finish(result)
    }

    async fn fetch_and_ingest(&self, origin: &str, media_id: &str) -> DownloadResult {
        let url = self.download_url(origin, media_id);
        tracing::info!(origin = %origin, media_id = %media_id, "downloading remote media");

        let resource = self.fetcher.fetch(&url, &[], None).await?;
        let content_type = if resource.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            resource.content_type.clone()
        };

        let mut reader = StreamReader::new(resource.stream);
        match self
            .store
            .ingest(
                &mut reader,
                &content_type,
                resource.filename.as_deref(),
                None,
                origin,
                Some(media_id),
            )
            .await
        {
            Ok(record) => Ok(record),
            Err(IngestError::DuplicateRecord { .. }) => {
                // Lost the insert race to a concurrent ingestion; the
                // winner's record is this download's result.
                match self.store.index().get(origin, media_id).await {
                    Ok(Some(record)) => Ok(record),
                    Ok(None) => Err(RemoteError::NotFound(RemoteFetchKey::new(origin, media_id))),
                    Err(e) => Err(RemoteError::Store(e.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn download_url(&self, origin: &str, media_id: &str) -> String {
        let scheme = if self.insecure_http { "http" } else { "https" };
        format!("{scheme}://{origin}/_matrix/media/v3/download/{origin}/{media_id}")
    }
}

/// Removes the registry entry and notifies waiters exactly once, even
/// when the initiating future is dropped mid-fetch.
struct BroadcastGuard<'a> {
    registry: &'a Registry,
    key: Option<RemoteFetchKey>,
}

impl BroadcastGuard<'_> {
    fn finish(mut self, result: DownloadResult) -> DownloadResult {
        if let Some(key) = self.key.take() {
            broadcast(self.registry, &key, &result);
        }
        result
    }
}

impl Drop for BroadcastGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            broadcast(self.registry, &key, &Err(RemoteError::Interrupted));
        }
    }
}

fn broadcast(registry: &Registry, key: &RemoteFetchKey, result: &DownloadResult) {
    let waiters = registry.lock().remove(key).unwrap_or_default();
    if !waiters.is_empty() {
        tracing::debug!(key = %key, waiters = waiters.len(), "broadcasting download result");
    }
    for tx in waiters {
        let _ = tx.send(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::net::{AddressPolicy, SafeResolver};
    use crate::store::{FsBlobStore, MemoryIndex};

    async fn make_handler(insecure_http: bool) -> (ResourceHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let store = Arc::new(MediaStore::new(index, blobs, 0));
        let resolver = Arc::new(SafeResolver::new(AddressPolicy::default()));
        let fetcher = SafeFetcher::new(resolver, RemoteConfig::default());
        (ResourceHandler::new(fetcher, store, insecure_http), dir)
    }

    #[tokio::test]
    async fn download_url_format() {
        let (handler, _dir) = make_handler(false).await;
        assert_eq!(
            handler.download_url("example.org", "abc123"),
            "https://example.org/_matrix/media/v3/download/example.org/abc123"
        );

        let (handler, _dir) = make_handler(true).await;
        assert_eq!(
            handler.download_url("127.0.0.1:4000", "m"),
            "http://127.0.0.1:4000/_matrix/media/v3/download/127.0.0.1:4000/m"
        );
    }

    #[tokio::test]
    async fn unsafe_destination_is_broadcast() {
        // Loopback origin with the default policy fails resolution
        // before any socket is opened.
        let (handler, _dir) = make_handler(true).await;
        let err = handler.download("127.0.0.1:9", "m1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Fetch(FetchError::Resolve(_))));
        // The registry entry is gone; a retry gets a fresh fetch.
        assert!(handler.registry.lock().is_empty());
    }
}
