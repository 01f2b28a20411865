//! Origin/host allow-listing and connection quotas.

use crate::config::ServerConfig;
use crate::error::Rejection;
use crate::registry::ConnectionRegistry;
use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use url::Url;

/// An allow-list entry reduced to the parts that are compared.
#[derive(Debug, Clone)]
struct AllowedOrigin {
    /// The entry exactly as configured.
    raw: String,
    /// Scheme and hostname, or `None` if the entry does not parse.
    parsed: Option<(String, String)>,
}

/// Origin and Host allow-list evaluation.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<AllowedOrigin>,
    allow_same_host_different_port: bool,
}

/// Scheme and hostname of a URL-like string.
fn scheme_and_host(value: &str) -> Option<(String, String)> {
    let url = Url::parse(value).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some((url.scheme().to_string(), host))
}

/// Hostname of a `Host` header value, ignoring any port suffix.
fn host_header_hostname(host_header: &str) -> Option<String> {
    let trimmed = host_header.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = Url::parse(&format!("http://{trimmed}")).ok()?;
    url.host_str().map(str::to_ascii_lowercase)
}

impl OriginPolicy {
    /// Build a policy from the configured allow-list.
    #[must_use]
    pub fn new(allowed_origins: &[String], allow_same_host_different_port: bool) -> Self {
        let allowed = allowed_origins
            .iter()
            .map(|raw| AllowedOrigin {
                raw: raw.clone(),
                parsed: scheme_and_host(raw),
            })
            .collect();
        Self {
            allowed,
            allow_same_host_different_port,
        }
    }

    /// Build a policy from server configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            &config.allowed_origins,
            config.allow_same_host_different_port,
        )
    }

    /// Allow-list entries that could not be parsed and are ignored for host matching.
    pub fn malformed_entries(&self) -> impl Iterator<Item = &str> {
        self.allowed
            .iter()
            .filter(|a| a.parsed.is_none())
            .map(|a| a.raw.as_str())
    }

    /// `true` when no allow-list is configured.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Whether an `Origin` header value is acceptable.
    #[must_use]
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.is_open() {
            return true;
        }
        if self.allowed.iter().any(|a| a.raw == origin) {
            return true;
        }
        if !self.allow_same_host_different_port {
            return false;
        }
        let Some(candidate) = scheme_and_host(origin) else {
            return false;
        };
        self.allowed
            .iter()
            .filter_map(|a| a.parsed.as_ref())
            .any(|p| *p == candidate)
    }

    /// Whether a `Host` header names one of the allow-listed hostnames.
    /// Used when a request carries no `Origin`.
    #[must_use]
    pub fn is_host_allowed(&self, host_header: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(hostname) = host_header.and_then(host_header_hostname) else {
            return false;
        };
        self.allowed
            .iter()
            .filter_map(|a| a.parsed.as_ref())
            .any(|(_, host)| *host == hostname)
    }

    /// Origin check when present, Host fallback otherwise.
    #[must_use]
    pub fn is_token_request_allowed(&self, origin: Option<&str>, host_header: Option<&str>) -> bool {
        match origin {
            Some(o) => self.is_origin_allowed(o),
            None => self.is_host_allowed(host_header),
        }
    }
}

/// Connection quotas enforced before a channel is opened.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Maximum total open connections.
    pub max_total: usize,
    /// Maximum open connections per client IP.
    pub max_per_ip: usize,
}

impl ConnectionLimits {
    /// Limits from server configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_total: config.max_conns,
            max_per_ip: config.max_conns_ip,
        }
    }
}

/// Check whether one more connection from `ip` fits.
///
/// The global limit is checked first so the two exhaustion cases stay
/// distinguishable.
pub fn admit_new_connection(
    registry: &ConnectionRegistry,
    ip: IpAddr,
    limits: ConnectionLimits,
) -> Result<(), Rejection> {
    if registry.size() >= limits.max_total {
        return Err(Rejection::CapacityGlobal);
    }
    if registry.per_ip_size(ip) >= limits.max_per_ip {
        return Err(Rejection::CapacityPerIp);
    }
    Ok(())
}

/// Query parameter carrying the session token on a channel upgrade.
pub const SESSION_TOKEN_PARAM: &str = "sessionToken";

/// Pull the session token out of an upgrade request's path and query.
///
/// Returns `Ok(None)` when the parameter is absent.
pub fn session_token_param(path_and_query: &str) -> Result<Option<String>, Rejection> {
    let base = Url::parse("http://localhost/").map_err(|_| Rejection::BadRequest)?;
    let url = base
        .join(path_and_query)
        .map_err(|_| Rejection::BadRequest)?;
    Ok(url
        .query_pairs()
        .find(|(k, _)| k == SESSION_TOKEN_PARAM)
        .map(|(_, v)| v.into_owned()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the client IP for a request.
///
/// Forwarding headers are consulted only when `trust_proxy` is set, in the
/// order `CF-Connecting-IP`, left-most `X-Forwarded-For`, `X-Real-IP`.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap, peer_addr: &SocketAddr, trust_proxy: bool) -> IpAddr {
    if !trust_proxy {
        return peer_addr.ip();
    }

    if let Some(ip) = header_str(headers, "cf-connecting-ip").and_then(|v| v.trim().parse().ok()) {
        return ip;
    }
    if let Some(ip) = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }
    if let Some(ip) = header_str(headers, "x-real-ip").and_then(|v| v.trim().parse().ok()) {
        return ip;
    }

    peer_addr.ip()
}

/// `Origin` header, if present and valid UTF-8.
#[must_use]
pub fn request_origin(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "origin")
}

/// `Host` header, if present and valid UTF-8.
#[must_use]
pub fn request_host(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "host")
}
