//! SSRF-safe outbound HTTP
//!
//! [`SafeFetcher`] performs GET requests for remote media and URL
//! previews. reqwest exposes no before-connect hook, so automatic
//! redirect following is disabled and hops are walked manually: every
//! hop's host is resolved and policy-checked, and the connection is
//! pinned to the resolved IP so the hostname is never re-resolved
//! between validation and connect.
//!
//! Redirects may not change host. The only port change admitted is the
//! default-port crossing (80 <-> 443) for URLs that named no explicit
//! port, and only when the re-resolved address equals the one already
//! validated.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use super::policy::glob_matches;
use super::resolve::{infer_ports, ResolveError, SafeResolver};
use crate::config::RemoteConfig;

/// Maximum redirect hops followed per fetch
pub const MAX_REDIRECTS: u32 = 5;

/// Outbound fetch errors
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("upstream returned status {status}")]
    UpstreamError { status: u16 },

    #[error("content exceeds the configured maximum of {max} bytes")]
    ContentTooLarge { max: u64 },

    #[error("content type '{0}' is not supported here")]
    UnsupportedContentType(String),

    #[error("stopped after {0} redirects")]
    TooManyRedirects(u32),

    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// A successful fetch: the (possibly truncated) byte stream plus the
/// headers the ingestion path cares about.
pub struct FetchedResource {
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    pub filename: Option<String>,
    pub content_type: String,
}

impl std::fmt::Debug for FetchedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedResource")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Validated dial context for one request, carried across redirect hops.
#[derive(Debug, Clone)]
struct HopGuard {
    host: String,
    ip: std::net::IpAddr,
    primary_port: u16,
    alt_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopKind {
    Primary,
    Alternate,
}

/// Decide whether a hop at `host:port` is admitted under a validated
/// context of `guard_host` with the given primary/alternate ports.
fn hop_kind(
    guard_host: &str,
    primary_port: u16,
    alt_port: Option<u16>,
    host: &str,
    port: u16,
) -> Result<HopKind, FetchError> {
    if host != guard_host {
        return Err(ResolveError::UnsafeDestination(format!(
            "redirect to unexpected host '{host}'"
        ))
        .into());
    }
    if port == primary_port {
        return Ok(HopKind::Primary);
    }
    if alt_port == Some(port) {
        return Ok(HopKind::Alternate);
    }
    Err(ResolveError::UnsafeDestination(format!(
        "redirect to unexpected port {port} on '{host}'"
    ))
    .into())
}

/// An alternate-port hop re-resolves the host; the crossing is
/// admitted only when the fresh address equals the one already
/// validated for this request.
fn alternate_hop_ip(
    host: &str,
    validated: std::net::IpAddr,
    resolved: std::net::IpAddr,
) -> Result<std::net::IpAddr, FetchError> {
    if resolved == validated {
        Ok(resolved)
    } else {
        Err(ResolveError::UnsafeDestination(format!(
            "alternate port for '{host}' resolved to a different address"
        ))
        .into())
    }
}

/// SSRF-safe HTTP fetcher for remote media and previews.
pub struct SafeFetcher {
    resolver: std::sync::Arc<SafeResolver>,
    config: RemoteConfig,
}

impl SafeFetcher {
    pub fn new(resolver: std::sync::Arc<SafeResolver>, config: RemoteConfig) -> Self {
        Self { resolver, config }
    }

    /// GET a URL and return its byte stream.
    ///
    /// `accepted_types` are `*`-glob patterns the response content type
    /// must satisfy; every supplied pattern must match (an empty slice
    /// accepts anything). `language` is forwarded as `Accept-Language`.
    pub async fn fetch(
        &self,
        url: &str,
        accepted_types: &[&str],
        language: Option<&str>,
    ) -> Result<FetchedResource, FetchError> {
        let mut current =
            Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let mut guard: Option<HopGuard> = None;
        let mut hops = 0u32;

        loop {
            let response = self.get_once(&current, &mut guard, language).await?;
            let status = response.status();

            if status.is_redirection() {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects(MAX_REDIRECTS));
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(FetchError::UpstreamError {
                        status: status.as_u16(),
                    })?;
                let next = current
                    .join(location)
                    .map_err(|_| FetchError::InvalidUrl(location.to_string()))?;
                tracing::debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            if status != StatusCode::OK {
                tracing::warn!(url = %current, status = status.as_u16(), "upstream error");
                return Err(FetchError::UpstreamError {
                    status: status.as_u16(),
                });
            }

            return self.into_resource(response, accepted_types);
        }
    }

    /// Issue one request, validating and pinning the dial destination.
    async fn get_once(
        &self,
        url: &Url,
        guard: &mut Option<HopGuard>,
        language: Option<&str>,
    ) -> Result<reqwest::Response, FetchError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ResolveError::SchemeUnsupported(scheme.to_string()).into());
        }
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_ascii_lowercase();
        let explicit_port = url.port();

        let (ip, dial_port) = match guard {
            None => {
                let dest = self.resolver.resolve(&host, explicit_port, scheme).await?;
                *guard = Some(HopGuard {
                    host: host.clone(),
                    ip: dest.ip,
                    primary_port: dest.port,
                    alt_port: dest.alt_port,
                });
                (dest.ip, dest.port)
            }
            Some(g) => {
                let (port, _) = infer_ports(scheme, explicit_port)?;
                match hop_kind(&g.host, g.primary_port, g.alt_port, &host, port)? {
                    HopKind::Primary => (g.ip, g.primary_port),
                    HopKind::Alternate => {
                        let dest = self.resolver.resolve(&host, Some(port), scheme).await?;
                        (alternate_hop_ip(&host, g.ip, dest.ip)?, port)
                    }
                }
            }
        };

        // Fresh client per hop: no pooled connection may outlive its
        // validation, and the dial is pinned to the checked IP.
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .user_agent(&self.config.user_agent);

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<std::net::IpAddr>().is_err() {
            builder = builder.resolve(&host, SocketAddr::new(ip, dial_port));
        }

        if self.config.unsafe_certificates {
            tracing::warn!(url = %url, "ignoring certificate errors for this request");
            builder = builder.danger_accept_invalid_certs(true).tls_sni(false);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Http(format!("failed to build client: {e}")))?;

        let mut request = client.get(url.clone());
        if let Some(language) = language {
            request = request.header(ACCEPT_LANGUAGE, language);
        }

        request
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))
    }

    /// Apply the size ceiling and content-type patterns to a 200
    /// response and hand back the wrapped stream.
    fn into_resource(
        &self,
        response: reqwest::Response,
        accepted_types: &[&str],
    ) -> Result<FetchedResource, FetchError> {
        let max_size = self.config.max_size_bytes;

        if max_size > 0 {
            if let Some(declared) = response.content_length() {
                if declared > max_size {
                    return Err(FetchError::ContentTooLarge { max: max_size });
                }
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        for pattern in accepted_types {
            if !glob_matches(pattern, &content_type) {
                return Err(FetchError::UnsupportedContentType(content_type));
            }
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename);

        let raw = response.bytes_stream();
        let stream: BoxStream<'static, std::io::Result<Bytes>> = if max_size > 0 {
            // Never trust headers alone: reading past the ceiling
            // truncates the stream instead of buffering the rest.
            Box::pin(raw.scan(max_size, |remaining, item| {
                let out = match item {
                    Err(e) => Some(Err(std::io::Error::other(e))),
                    Ok(chunk) => {
                        if *remaining == 0 {
                            None
                        } else {
                            let take = chunk.len().min(*remaining as usize);
                            *remaining -= take as u64;
                            Some(Ok(chunk.slice(0..take)))
                        }
                    }
                };
                futures_util::future::ready(out)
            }))
        } else {
            Box::pin(raw.map(|item| item.map_err(std::io::Error::other)))
        };

        Ok(FetchedResource {
            stream,
            filename,
            content_type,
        })
    }
}

/// Pull the `filename` parameter out of a `Content-Disposition` header,
/// if there is one. Absence is not an error.
fn disposition_filename(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part
            .strip_prefix("filename=")
            .or_else(|| part.strip_prefix("FILENAME="))
        {
            let value = value.trim().trim_matches('"');
            if value.is_empty() {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_kind_admits_primary_port() {
        assert_eq!(
            hop_kind("example.com", 80, Some(443), "example.com", 80).unwrap(),
            HopKind::Primary
        );
    }

    #[test]
    fn hop_kind_admits_alternate_port() {
        assert_eq!(
            hop_kind("example.com", 80, Some(443), "example.com", 443).unwrap(),
            HopKind::Alternate
        );
        assert_eq!(
            hop_kind("example.com", 443, Some(80), "example.com", 80).unwrap(),
            HopKind::Alternate
        );
    }

    #[test]
    fn hop_kind_rejects_host_change() {
        let err = hop_kind("example.com", 80, Some(443), "evil.example", 80).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Resolve(ResolveError::UnsafeDestination(_))
        ));
    }

    #[test]
    fn hop_kind_rejects_unexpected_port() {
        let err = hop_kind("example.com", 80, Some(443), "example.com", 8080).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Resolve(ResolveError::UnsafeDestination(_))
        ));
    }

    #[test]
    fn hop_kind_without_alternate_rejects_port_crossing() {
        // Explicit-port URLs record no alternate; a redirect to any
        // other port is refused.
        let err = hop_kind("example.com", 8080, None, "example.com", 443).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Resolve(ResolveError::UnsafeDestination(_))
        ));
    }

    #[test]
    fn alternate_hop_admits_only_the_validated_address() {
        let validated: std::net::IpAddr = "93.184.216.34".parse().unwrap();
        assert_eq!(
            alternate_hop_ip("example.com", validated, validated).unwrap(),
            validated
        );
    }

    #[test]
    fn alternate_hop_rejects_a_rebound_address() {
        // A DNS answer that changed between the primary validation and
        // the port crossing must not be dialed.
        let validated: std::net::IpAddr = "93.184.216.34".parse().unwrap();
        let rebound: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        let err = alternate_hop_ip("example.com", validated, rebound).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Resolve(ResolveError::UnsafeDestination(_))
        ));
    }

    #[test]
    fn disposition_filename_variants() {
        assert_eq!(
            disposition_filename("attachment; filename=\"cat.png\""),
            Some("cat.png".to_string())
        );
        assert_eq!(
            disposition_filename("inline; filename=report.pdf"),
            Some("report.pdf".to_string())
        );
        assert_eq!(disposition_filename("attachment"), None);
        assert_eq!(disposition_filename("attachment; filename=\"\""), None);
    }
}
