//! Raw HTTP/1.1 front-ends: public Host-routed plane and admin tunnel
//! provisioning plane. Both speak hyper directly (no framework router) so
//! the public plane can drop to the raw `TokioIo` socket an upgrade needs.

pub mod admin;
pub mod public;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Response;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn json_response(status: hyper::StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    let bytes = Bytes::from(body.to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(
            Full::new(bytes)
                .map_err(|never: std::convert::Infallible| match never {})
                .boxed(),
        )
        .expect("static response is well-formed")
}

pub fn empty_status(status: hyper::StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::new())
                .map_err(|never: std::convert::Infallible| match never {})
                .boxed(),
        )
        .expect("static response is well-formed")
}

/// Extract the leftmost label of `host` as a subdomain of `base_domain`.
/// Returns `None` if `host` isn't a subdomain of `base_domain` at all (the
/// caller then falls through to the admin front-end for single-port setups).
pub fn subdomain_of(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let base = base_domain.to_ascii_lowercase();
    let suffix = format!(".{base}");
    host.strip_suffix(&suffix)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_subdomain() {
        assert_eq!(
            subdomain_of("myapp.example.com", "example.com"),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn strips_port_before_matching() {
        assert_eq!(
            subdomain_of("myapp.example.com:8080", "example.com"),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn non_matching_host_returns_none() {
        assert_eq!(subdomain_of("example.com", "example.com"), None);
        assert_eq!(subdomain_of("other.org", "example.com"), None);
    }
}
