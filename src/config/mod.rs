//! Repository configuration
//!
//! Plain serde types with conservative defaults. Everything is
//! overridable field-by-field; builders are provided for the values
//! tests and embedders most often need to change.

use serde::{Deserialize, Serialize};

/// Default remote fetch timeout in seconds
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 20;

/// Default remote download size ceiling (100MB)
pub const DEFAULT_REMOTE_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Default upload size ceiling (100MB)
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Default User-Agent for outbound requests
pub const DEFAULT_USER_AGENT: &str = concat!("remora/", env!("CARGO_PKG_VERSION"));

/// Top-level repository configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub uploads: UploadConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Limits applied to local uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum upload size in bytes; 0 disables the ceiling
    #[serde(default = "default_upload_max_size")]
    pub max_size_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_UPLOAD_MAX_SIZE,
        }
    }
}

fn default_upload_max_size() -> u64 {
    DEFAULT_UPLOAD_MAX_SIZE
}

/// Behavior of outbound remote-media and preview fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Total per-request timeout in seconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// Maximum response size in bytes; 0 disables the ceiling
    #[serde(default = "default_remote_max_size")]
    pub max_size_bytes: u64,

    /// User-Agent header sent on outbound requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Skip TLS certificate verification. The SNI hostname is blanked
    /// when this is on, so internal hostnames are not leaked in the
    /// handshake.
    #[serde(default)]
    pub unsafe_certificates: bool,

    /// Build remote download URLs with plain http. Intended for tests
    /// and single-host development setups only.
    #[serde(default)]
    pub insecure_http: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            max_size_bytes: DEFAULT_REMOTE_MAX_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            unsafe_certificates: false,
            insecure_http: false,
        }
    }
}

fn default_remote_timeout() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

fn default_remote_max_size() -> u64 {
    DEFAULT_REMOTE_MAX_SIZE
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl RemoteConfig {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }
}

/// Outbound address policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CIDR ranges permitted even when the built-in policy would deny
    /// them (e.g. "10.1.0.0/16" for an internal homeserver)
    #[serde(default)]
    pub allowed_ranges: Vec<String>,

    /// CIDR ranges denied on top of the built-in policy
    #[serde(default)]
    pub denied_ranges: Vec<String>,

    /// Hostname globs that are never dialed (e.g. "*.internal")
    #[serde(default)]
    pub denied_hosts: Vec<String>,
}
