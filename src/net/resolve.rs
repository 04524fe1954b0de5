//! Safe address resolution
//!
//! Every outbound dial goes through [`SafeResolver`]: hostname to IP,
//! then policy classification, before any TCP or TLS handshake. When
//! the URL carries no explicit port the scheme's default is used and
//! the opposite default (80 <-> 443) is recorded as the one alternate
//! a same-host redirect may cross to without a second trust decision.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

use super::policy::AddressPolicy;

/// Address resolution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("destination not allowed: {0}")]
    UnsafeDestination(String),

    #[error("cannot determine port for scheme '{0}'")]
    SchemeUnsupported(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("DNS resolution failed for {host}: {message}")]
    Dns { host: String, message: String },
}

/// A policy-checked destination: the concrete IP to dial, the port the
/// request is expected on, and (for default-port URLs) the alternate
/// port accepted for same-host scheme-crossing redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeDestination {
    pub ip: IpAddr,
    pub port: u16,
    pub alt_port: Option<u16>,
}

/// Infer (port, alternate port) from a URL scheme when the URL itself
/// does not name one.
pub fn infer_ports(scheme: &str, explicit_port: Option<u16>) -> Result<(u16, Option<u16>), ResolveError> {
    if let Some(port) = explicit_port {
        return Ok((port, None));
    }
    match scheme {
        "http" => Ok((80, Some(443))),
        "https" => Ok((443, Some(80))),
        other => Err(ResolveError::SchemeUnsupported(other.to_string())),
    }
}

/// Resolves hostnames and enforces the outbound address policy.
pub struct SafeResolver {
    resolver: TokioAsyncResolver,
    policy: Arc<AddressPolicy>,
}

impl SafeResolver {
    pub fn new(policy: AddressPolicy) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    /// Resolve a host to a dialable [`SafeDestination`].
    ///
    /// Literal IP hosts skip DNS but are classified all the same. For
    /// hostnames, the first resolved address the policy accepts wins;
    /// if every address is denied the whole destination is unsafe.
    pub async fn resolve(
        &self,
        host: &str,
        explicit_port: Option<u16>,
        scheme: &str,
    ) -> Result<SafeDestination, ResolveError> {
        if host.is_empty() {
            return Err(ResolveError::InvalidHost("empty host".to_string()));
        }

        let (port, alt_port) = infer_ports(scheme, explicit_port)?;

        if self.policy.host_denied(host) {
            return Err(ResolveError::UnsafeDestination(format!(
                "host '{host}' is denied by policy"
            )));
        }

        // Bracketed IPv6 literals arrive with their brackets from URL hosts.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            self.check_ip(&ip, host)?;
            return Ok(SafeDestination { ip, port, alt_port });
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ResolveError::Dns {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let mut denied = None;
        for ip in lookup.iter() {
            match self.check_ip(&ip, host) {
                Ok(()) => {
                    tracing::debug!(host = %host, ip = %ip, "resolved safe destination");
                    return Ok(SafeDestination { ip, port, alt_port });
                }
                Err(e) => denied = Some(e),
            }
        }

        Err(denied.unwrap_or_else(|| ResolveError::Dns {
            host: host.to_string(),
            message: "no addresses returned".to_string(),
        }))
    }

    fn check_ip(&self, ip: &IpAddr, host: &str) -> Result<(), ResolveError> {
        if self.policy.ip_allowed(ip) {
            Ok(())
        } else {
            Err(ResolveError::UnsafeDestination(format!(
                "{host} resolved to disallowed address {ip}"
            )))
        }
    }
}
