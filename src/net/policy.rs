//! Outbound address policy
//!
//! Classifies destination addresses before any socket is opened. The
//! default policy refuses loopback, link-local, multicast, RFC1918
//! private ranges, CGNAT, and IPv6 unique-local addresses; deployments
//! can widen it with `allowed_ranges` or tighten it further with
//! `denied_ranges` and `denied_hosts` globs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::config::NetworkConfig;

/// Errors raised while building a policy from configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("invalid CIDR range '{0}'")]
    InvalidRange(String),
}

/// An IPv4 or IPv6 prefix, parsed from `addr/len` (or a bare address,
/// which is treated as a full-length prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    V4 { net: u32, prefix: u8 },
    V6 { net: u128, prefix: u8 },
}

impl IpRange {
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, len)) => {
                let prefix: u8 = len
                    .parse()
                    .map_err(|_| PolicyError::InvalidRange(s.to_string()))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };

        let ip: IpAddr = addr
            .parse()
            .map_err(|_| PolicyError::InvalidRange(s.to_string()))?;

        match ip {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(PolicyError::InvalidRange(s.to_string()));
                }
                Ok(IpRange::V4 {
                    net: u32::from(v4) & mask4(prefix),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(PolicyError::InvalidRange(s.to_string()));
                }
                Ok(IpRange::V6 {
                    net: u128::from(v6) & mask6(prefix),
                    prefix,
                })
            }
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        // IPv4-mapped IPv6 addresses are compared against v4 ranges.
        let ip = canonical(ip);
        match (self, ip) {
            (IpRange::V4 { net, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & mask4(*prefix) == *net
            }
            (IpRange::V6 { net, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & mask6(*prefix) == *net
            }
            _ => false,
        }
    }
}

fn mask4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn mask6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

fn canonical(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => *ip,
        },
        _ => *ip,
    }
}

/// Deny policy applied to every resolved destination address.
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    allowed: Vec<IpRange>,
    denied: Vec<IpRange>,
    denied_hosts: Vec<String>,
}

impl AddressPolicy {
    /// Build a policy from configuration, parsing the CIDR lists.
    pub fn from_config(config: &NetworkConfig) -> Result<Self, PolicyError> {
        let allowed = config
            .allowed_ranges
            .iter()
            .map(|s| IpRange::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let denied = config
            .denied_ranges
            .iter()
            .map(|s| IpRange::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed,
            denied,
            denied_hosts: config.denied_hosts.clone(),
        })
    }

    /// Whether a hostname is matched by a configured `denied_hosts` glob.
    pub fn host_denied(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.denied_hosts
            .iter()
            .any(|pattern| glob_matches(&pattern.to_ascii_lowercase(), &host))
    }

    /// Whether a resolved address may be dialed.
    ///
    /// Admin `allowed_ranges` override the built-in denials; admin
    /// `denied_ranges` are checked on top of them.
    pub fn ip_allowed(&self, ip: &IpAddr) -> bool {
        if self.denied.iter().any(|r| r.contains(ip)) {
            return false;
        }
        if self.allowed.iter().any(|r| r.contains(ip)) {
            return true;
        }
        !is_internal(ip)
    }
}

/// Built-in classification of addresses a media repository must never
/// dial on behalf of a remote party.
fn is_internal(ip: &IpAddr) -> bool {
    match canonical(ip) {
        IpAddr::V4(v4) => is_internal_v4(&v4),
        IpAddr::V6(v6) => is_internal_v6(&v6),
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    if ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return true;
    }

    // RFC1918 private ranges
    if ip.is_private() {
        return true;
    }

    // 169.254.0.0/16 link-local (includes cloud metadata endpoints)
    if ip.is_link_local() {
        return true;
    }

    // 100.64.0.0/10 CGNAT
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return true;
    }

    // 0.0.0.0/8 current network
    if octets[0] == 0 {
        return true;
    }

    // 198.18.0.0/15 benchmarking
    if octets[0] == 198 && (octets[1] == 18 || octets[1] == 19) {
        return true;
    }

    false
}

fn is_internal_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }

    let segments = ip.segments();

    // fc00::/7 unique local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }

    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }

    false
}

/// Simple `*`-wildcard glob match, the same semantics the original
/// stack used for hostname and content-type patterns.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let last = parts.len() - 1;
    let mut rest = value;

    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return part.is_empty() || rest.ends_with(part);
        } else if part.is_empty() {
            continue;
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }

    true
}
