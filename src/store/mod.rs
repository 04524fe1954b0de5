//! Content-addressed media storage
//!
//! Metadata records live in a [`MediaIndex`]; bytes live in a
//! [`BlobStore`]; [`MediaStore`] ties the two together with the
//! hash-deduplicating ingestion pipeline.

pub mod blob;
pub mod index;
pub mod ingest;
pub mod record;

pub use blob::{BlobError, BlobStore, FsBlobStore};
pub use index::MemoryIndex;
pub use ingest::{IngestError, MediaStore};
pub use record::{now_millis, IndexError, MediaIndex, MediaRecord, RemoteFetchKey};
