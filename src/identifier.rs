//! Client identifier: what a reconnect attempt is compared against to decide
//! whether it may reclaim a subdomain still in its grace period.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

const MAX_TOKEN_LEN: usize = 256;

/// Tagged identity of a tunnel-creation caller, compared by `(kind, value)`
/// equality on reconnect. Constructed once at creation time and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Ip(String),
    Token(String),
}

impl Identifier {
    /// Derive an identifier from request headers, per the rule: prefer a
    /// valid `X-LT-Client-Token`, else fall back to the caller's source IP
    /// (honoring `X-Forwarded-For` / `X-Real-IP` only when `trust_proxy`).
    pub fn from_request(
        client_token: Option<&str>,
        peer_ip: &str,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        trust_proxy: bool,
    ) -> Self {
        if let Some(token) = client_token {
            let trimmed = token.trim();
            if !trimmed.is_empty() && trimmed.len() <= MAX_TOKEN_LEN && TOKEN_RE.is_match(trimmed)
            {
                return Identifier::Token(trimmed.to_string());
            }
        }

        if trust_proxy {
            if let Some(xff) = forwarded_for {
                if let Some(first) = xff.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return Identifier::Ip(first.to_string());
                    }
                }
            }
            if let Some(ip) = real_ip {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return Identifier::Ip(ip.to_string());
                }
            }
        }

        Identifier::Ip(peer_ip.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_token_takes_precedence_over_ip() {
        let id = Identifier::from_request(Some("abc-123"), "1.2.3.4", None, None, false);
        assert_eq!(id, Identifier::Token("abc-123".to_string()));
    }

    #[test]
    fn invalid_token_falls_back_to_ip() {
        let id = Identifier::from_request(Some("bad token!"), "1.2.3.4", None, None, false);
        assert_eq!(id, Identifier::Ip("1.2.3.4".to_string()));
    }

    #[test]
    fn oversized_token_falls_back_to_ip() {
        let long = "a".repeat(300);
        let id = Identifier::from_request(Some(&long), "1.2.3.4", None, None, false);
        assert_eq!(id, Identifier::Ip("1.2.3.4".to_string()));
    }

    #[test]
    fn untrusted_proxy_headers_are_ignored() {
        let id = Identifier::from_request(None, "1.2.3.4", Some("9.9.9.9"), None, false);
        assert_eq!(id, Identifier::Ip("1.2.3.4".to_string()));
    }

    #[test]
    fn trusted_forwarded_for_is_used() {
        let id =
            Identifier::from_request(None, "1.2.3.4", Some("9.9.9.9, 8.8.8.8"), None, true);
        assert_eq!(id, Identifier::Ip("9.9.9.9".to_string()));
    }

    #[test]
    fn trusted_real_ip_used_without_forwarded_for() {
        let id = Identifier::from_request(None, "1.2.3.4", None, Some("7.7.7.7"), true);
        assert_eq!(id, Identifier::Ip("7.7.7.7".to_string()));
    }
}
