//! Network safety layer
//!
//! All outbound byte retrieval goes through this module: address
//! policy, safe resolution, and the redirect-aware fetcher.

pub mod fetch;
pub mod policy;
pub mod resolve;

pub use fetch::{FetchError, FetchedResource, SafeFetcher, MAX_REDIRECTS};
pub use policy::{glob_matches, AddressPolicy, IpRange, PolicyError};
pub use resolve::{ResolveError, SafeDestination, SafeResolver};
