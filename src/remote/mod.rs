//! Remote media retrieval

pub mod handler;

pub use handler::{DownloadResult, RemoteError, ResourceHandler};
