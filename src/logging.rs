//! Tracing setup
//!
//! Embedders own their subscriber; this helper covers binaries and
//! tests that just want `RUST_LOG`-driven output.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling
/// back to `default_filter`. Safe to call more than once; later calls
/// are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
