//! Short-lived capability tokens bound to a client IP and origin.

use crate::error::TokenRejection;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Random bytes per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A token as stored by [`SessionTokenStore`].
#[derive(Debug, Clone)]
struct SessionToken {
    bound_ip: IpAddr,
    /// Empty when the issuing request carried no Origin header.
    bound_origin: String,
    expires_at: u64,
}

/// Body of a successful token response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// Opaque token value.
    pub token: String,
    /// Absolute expiry in epoch milliseconds.
    pub expires_at: u64,
}

/// Issues and validates session tokens.
#[derive(Debug)]
pub struct SessionTokenStore {
    tokens: HashMap<String, SessionToken>,
    ttl_ms: u64,
}

impl SessionTokenStore {
    /// Create an empty store issuing tokens with the given lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Issue a token for `(ip, origin)` at the current time.
    pub fn issue(&mut self, ip: IpAddr, origin: Option<&str>) -> IssuedToken {
        self.issue_at(ip, origin, unix_now_ms())
    }

    /// Issue a token for `(ip, origin)` as of `now_ms`.
    pub fn issue_at(&mut self, ip: IpAddr, origin: Option<&str>, now_ms: u64) -> IssuedToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = URL_SAFE_NO_PAD.encode(bytes);
        let expires_at = now_ms.saturating_add(self.ttl_ms);

        self.tokens.insert(
            value.clone(),
            SessionToken {
                bound_ip: ip,
                bound_origin: origin.unwrap_or_default().to_string(),
                expires_at,
            },
        );

        IssuedToken {
            token: value,
            expires_at,
        }
    }

    /// Validate a token presented on a channel upgrade at the current time.
    pub fn validate(
        &mut self,
        token: &str,
        ip: IpAddr,
        origin: Option<&str>,
    ) -> Result<(), TokenRejection> {
        self.validate_at(token, ip, origin, unix_now_ms())
    }

    /// Validate a token as of `now_ms`.
    ///
    /// A successful validation leaves the token in place so that upgrade
    /// retries within the lifetime keep working. Expired or mismatched tokens
    /// are revoked.
    pub fn validate_at(
        &mut self,
        token: &str,
        ip: IpAddr,
        origin: Option<&str>,
        now_ms: u64,
    ) -> Result<(), TokenRejection> {
        if token.is_empty() {
            return Err(TokenRejection::Missing);
        }
        let Some(entry) = self.tokens.get(token) else {
            return Err(TokenRejection::Invalid);
        };

        let rejection = if entry.expires_at <= now_ms {
            Some(TokenRejection::Expired)
        } else if entry.bound_ip != ip {
            Some(TokenRejection::IpMismatch)
        } else {
            match origin {
                Some(o) if !entry.bound_origin.is_empty() && entry.bound_origin != o => {
                    Some(TokenRejection::OriginMismatch)
                }
                _ => None,
            }
        };

        match rejection {
            Some(reason) => {
                self.tokens.remove(token);
                Err(reason)
            }
            None => Ok(()),
        }
    }

    /// Drop every token whose expiry has passed. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(unix_now_ms())
    }

    /// Drop every token expired as of `now_ms`.
    pub fn sweep_expired_at(&mut self, now_ms: u64) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.expires_at > now_ms);
        before - self.tokens.len()
    }

    /// Number of stored tokens, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if no tokens are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://viewer.example.com";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn store() -> SessionTokenStore {
        SessionTokenStore::new(Duration::from_millis(5_000))
    }

    #[test]
    fn token_has_at_least_192_bits() {
        let mut s = store();
        let issued = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        let decoded = URL_SAFE_NO_PAD.decode(&issued.token).unwrap();
        assert!(decoded.len() * 8 >= 192);
        assert_eq!(issued.expires_at, 5_000);
    }

    #[test]
    fn tokens_are_unique() {
        let mut s = store();
        let a = s.issue_at(ip("10.0.0.1"), None, 0);
        let b = s.issue_at(ip("10.0.0.1"), None, 0);
        assert_ne!(a.token, b.token);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn validates_before_expiry_and_is_reusable() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        assert!(s.validate_at(&t.token, ip("10.0.0.1"), Some(ORIGIN), 0).is_ok());
        assert!(s.validate_at(&t.token, ip("10.0.0.1"), Some(ORIGIN), 4_999).is_ok());
    }

    #[test]
    fn expires_at_boundary_and_is_removed() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.1"), Some(ORIGIN), 5_000),
            Err(TokenRejection::Expired)
        );
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.1"), Some(ORIGIN), 0),
            Err(TokenRejection::Invalid)
        );
    }

    #[test]
    fn short_ttl_clamped_by_config_scenario() {
        let mut cfg = crate::config::test_config();
        cfg.session_token_ttl_ms = 2_000;
        let mut s = SessionTokenStore::new(cfg.token_ttl());
        let t = s.issue_at(ip("10.0.0.1"), None, 0);
        assert!(s.validate_at(&t.token, ip("10.0.0.1"), None, 4_000).is_ok());
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.1"), None, 5_001),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn missing_and_unknown_tokens() {
        let mut s = store();
        assert_eq!(
            s.validate_at("", ip("10.0.0.1"), None, 0),
            Err(TokenRejection::Missing)
        );
        assert_eq!(
            s.validate_at("nope", ip("10.0.0.1"), None, 0),
            Err(TokenRejection::Invalid)
        );
    }

    #[test]
    fn ip_mismatch_revokes_token() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.2"), Some(ORIGIN), 1),
            Err(TokenRejection::IpMismatch)
        );
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.1"), Some(ORIGIN), 1),
            Err(TokenRejection::Invalid)
        );
    }

    #[test]
    fn origin_mismatch_revokes_token() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.1"), Some("https://evil.example.com"), 1),
            Err(TokenRejection::OriginMismatch)
        );
        assert!(s.is_empty());
    }

    #[test]
    fn absent_request_origin_matches_bound_origin() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), Some(ORIGIN), 0);
        assert!(s.validate_at(&t.token, ip("10.0.0.1"), None, 1).is_ok());
    }

    #[test]
    fn empty_bound_origin_matches_any_origin() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), None, 0);
        assert!(s
            .validate_at(&t.token, ip("10.0.0.1"), Some("https://other.example.com"), 1)
            .is_ok());
    }

    #[test]
    fn expiry_checked_before_ip() {
        let mut s = store();
        let t = s.issue_at(ip("10.0.0.1"), None, 0);
        assert_eq!(
            s.validate_at(&t.token, ip("10.0.0.2"), None, 6_000),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut s = store();
        s.issue_at(ip("10.0.0.1"), None, 0);
        s.issue_at(ip("10.0.0.1"), None, 3_000);
        assert_eq!(s.sweep_expired_at(5_000), 1);
        assert_eq!(s.len(), 1);
        assert_eq!(s.sweep_expired_at(8_000), 1);
        assert!(s.is_empty());
    }
}
