//! remora: federated media repository core
//!
//! Three cooperating subsystems:
//!
//! - **Content-addressed storage** ([`store`]): bytes are hashed on
//!   ingestion and deduplicated across identities; every (origin,
//!   media id) pair keeps its own metadata record, possibly sharing a
//!   blob with others.
//! - **Coalesced remote downloads** ([`remote`]): concurrent requests
//!   for the same remote object share one outbound fetch and all
//!   observe its single result.
//! - **Network safety** ([`net`]): every outbound dial, including
//!   redirect hops, is resolved, policy-checked, and pinned to the
//!   validated address before any handshake.
//!
//! The HTTP API surface, database schema, and thumbnail codecs are
//! deliberately not here: the index and blob layers are traits
//! ([`store::MediaIndex`], [`store::BlobStore`]) for the embedding
//! server to implement, and [`service::MediaService`] is the call
//! surface an API layer consumes.

pub mod config;
pub mod logging;
pub mod net;
pub mod remote;
pub mod service;
pub mod store;

pub use config::RepoConfig;
pub use net::{AddressPolicy, FetchError, ResolveError, SafeFetcher, SafeResolver};
pub use remote::{DownloadResult, RemoteError, ResourceHandler};
pub use service::MediaService;
pub use store::{
    BlobStore, FsBlobStore, IngestError, MediaIndex, MediaRecord, MediaStore, MemoryIndex,
};
