//! HMAC authentication middleware for tunnel-creation admin routes.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::nonce::NonceCache;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingAuthorization,
    #[error("malformed Authorization header")]
    MalformedAuthorization,
    #[error("missing X-Timestamp header")]
    MissingTimestamp,
    #[error("X-Timestamp is not a valid integer")]
    MalformedTimestamp,
    #[error("timestamp outside tolerance window")]
    TimestampExpired,
    #[error("missing X-Nonce header")]
    MissingNonce,
    #[error("X-Nonce is not a valid integer")]
    MalformedNonce,
    #[error("nonce outside the accepted window")]
    NonceOutOfWindow,
    #[error("nonce has already been used")]
    NonceReplayed,
    #[error("HMAC signature mismatch")]
    SignatureMismatch,
}

impl AuthError {
    /// Message shown to the caller. `debug` controls whether the specific
    /// reason leaks or a generic message is substituted.
    pub fn client_message(&self, debug: bool) -> String {
        if debug {
            self.to_string()
        } else {
            "authentication failed".to_string()
        }
    }
}

/// Validates the `METHOD+PATH+TIMESTAMP+NONCE+BODY` HMAC scheme described
/// for admin tunnel-creation requests.
pub struct HmacAuthenticator {
    secret: String,
    timestamp_tolerance_secs: u64,
    nonce_threshold_secs: u64,
    nonce_cache_ttl_secs: u64,
}

impl HmacAuthenticator {
    pub fn new(
        secret: String,
        timestamp_tolerance_secs: u64,
        nonce_threshold_secs: u64,
        nonce_cache_ttl_secs: u64,
    ) -> Self {
        Self {
            secret,
            timestamp_tolerance_secs,
            nonce_threshold_secs,
            nonce_cache_ttl_secs,
        }
    }

    pub fn nonce_cache_ttl_secs(&self) -> u64 {
        self.nonce_cache_ttl_secs
    }

    /// Validate one request. `body` is the raw request body bytes (empty
    /// for the GET routes this middleware guards).
    pub fn validate(
        &self,
        method: &str,
        path: &str,
        authorization: Option<&str>,
        timestamp_header: Option<&str>,
        nonce_header: Option<&str>,
        body: &[u8],
        nonce_cache: &NonceCache,
    ) -> Result<(), AuthError> {
        let signature_hex = parse_authorization(authorization)?;

        let timestamp_str = timestamp_header.ok_or(AuthError::MissingTimestamp)?;
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| AuthError::MalformedTimestamp)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;

        if (now - timestamp).abs() > self.timestamp_tolerance_secs as i64 {
            return Err(AuthError::TimestampExpired);
        }

        let nonce_str = nonce_header.ok_or(AuthError::MissingNonce)?;
        let nonce: i64 = nonce_str.parse().map_err(|_| AuthError::MalformedNonce)?;

        let lower_bound_ms = (timestamp - self.nonce_threshold_secs as i64) * 1000;
        let upper_bound_ms = (timestamp + self.timestamp_tolerance_secs as i64) * 1000;
        if nonce < lower_bound_ms || nonce > upper_bound_ms {
            return Err(AuthError::NonceOutOfWindow);
        }

        if nonce_cache.contains(nonce_str) {
            return Err(AuthError::NonceReplayed);
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(timestamp_str.as_bytes());
        mac.update(nonce_str.as_bytes());
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        if expected.len() != signature_hex.len()
            || expected.as_bytes().ct_eq(signature_hex.as_bytes()).unwrap_u8() != 1
        {
            return Err(AuthError::SignatureMismatch);
        }

        // Only a fully successful validation consumes the nonce — a forged
        // signature must not burn a nonce the legitimate client still needs.
        nonce_cache.insert(nonce_str);

        Ok(())
    }
}

/// Parse `Authorization: HMAC sha256=<hex>`, returning the lowercase hex digest.
fn parse_authorization(header: Option<&str>) -> Result<String, AuthError> {
    let header = header.ok_or(AuthError::MissingAuthorization)?;
    let rest = header
        .strip_prefix("HMAC ")
        .ok_or(AuthError::MalformedAuthorization)?;
    let digest = rest
        .strip_prefix("sha256=")
        .ok_or(AuthError::MalformedAuthorization)?;
    if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AuthError::MalformedAuthorization);
    }
    Ok(digest.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn sign(secret: &str, method: &str, path: &str, ts: &str, nonce: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(ts.as_bytes());
        mac.update(nonce.as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn valid_request_is_accepted() {
        let auth = HmacAuthenticator::new("a".repeat(32), 60, 3600, 7200);
        let cache = NonceCache::new(std::time::Duration::from_secs(7200));
        let ts = now_secs();
        let nonce = ts * 1000;
        let sig = sign(&"a".repeat(32), "GET", "/myapp", &ts.to_string(), &nonce.to_string(), b"");
        let authz = format!("HMAC sha256={sig}");
        assert!(auth
            .validate(
                "GET",
                "/myapp",
                Some(&authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            )
            .is_ok());
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let auth = HmacAuthenticator::new("a".repeat(32), 60, 3600, 7200);
        let cache = NonceCache::new(std::time::Duration::from_secs(7200));
        let ts = now_secs();
        let nonce = ts * 1000;
        let sig = sign(&"a".repeat(32), "GET", "/myapp", &ts.to_string(), &nonce.to_string(), b"");
        let authz = format!("HMAC sha256={sig}");
        auth.validate(
            "GET",
            "/myapp",
            Some(&authz),
            Some(&ts.to_string()),
            Some(&nonce.to_string()),
            b"",
            &cache,
        )
        .unwrap();
        assert!(matches!(
            auth.validate(
                "GET",
                "/myapp",
                Some(&authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            ),
            Err(AuthError::NonceReplayed)
        ));
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let auth = HmacAuthenticator::new("a".repeat(32), 60, 3600, 7200);
        let cache = NonceCache::new(std::time::Duration::from_secs(7200));
        let ts = now_secs();
        let nonce = ts * 1000;
        let authz = "HMAC sha256=deadbeef";
        assert!(matches!(
            auth.validate(
                "GET",
                "/myapp",
                Some(authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            ),
            Err(AuthError::SignatureMismatch)
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let auth = HmacAuthenticator::new("a".repeat(32), 60, 3600, 7200);
        let cache = NonceCache::new(std::time::Duration::from_secs(7200));
        let ts = now_secs() - 1000;
        let nonce = ts * 1000;
        let sig = sign(&"a".repeat(32), "GET", "/myapp", &ts.to_string(), &nonce.to_string(), b"");
        let authz = format!("HMAC sha256={sig}");
        assert!(matches!(
            auth.validate(
                "GET",
                "/myapp",
                Some(&authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            ),
            Err(AuthError::TimestampExpired)
        ));
    }

    #[test]
    fn failed_signature_does_not_consume_nonce() {
        let auth = HmacAuthenticator::new("a".repeat(32), 60, 3600, 7200);
        let cache = NonceCache::new(std::time::Duration::from_secs(7200));
        let ts = now_secs();
        let nonce = ts * 1000;
        let bad_authz = "HMAC sha256=deadbeef";

        assert!(matches!(
            auth.validate(
                "GET",
                "/myapp",
                Some(bad_authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            ),
            Err(AuthError::SignatureMismatch)
        ));

        let sig = sign(&"a".repeat(32), "GET", "/myapp", &ts.to_string(), &nonce.to_string(), b"");
        let good_authz = format!("HMAC sha256={sig}");
        assert!(auth
            .validate(
                "GET",
                "/myapp",
                Some(&good_authz),
                Some(&ts.to_string()),
                Some(&nonce.to_string()),
                b"",
                &cache,
            )
            .is_ok());
    }

    #[test]
    fn malformed_authorization_header_is_rejected() {
        assert!(matches!(
            parse_authorization(Some("Bearer abc")),
            Err(AuthError::MalformedAuthorization)
        ));
        assert!(matches!(
            parse_authorization(None),
            Err(AuthError::MissingAuthorization)
        ));
    }
}
