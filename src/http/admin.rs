//! Admin plane: tunnel provisioning, status endpoints, HMAC-guarded creation.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use regex::Regex;
use sysinfo::{Pid, System};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

use crate::http::{empty_status, json_response, BoxBody};
use crate::identifier::Identifier;
use crate::manager::NewClientError;
use crate::state::AppState;

static SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9][a-z0-9\-]{4,63}[a-z0-9]|[a-z0-9]{4,63})$").unwrap()
});

const INVALID_SUBDOMAIN_MESSAGE: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

pub async fn run(
    state: Arc<AppState>,
    bind_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "admin plane listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "admin plane accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, std::convert::Infallible>(route(state, req, peer_addr).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(peer = %peer_addr, error = %e, "admin connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

/// Routing logic for the admin plane. Exposed at crate visibility so the
/// public plane can delegate to it directly in single-port deployments
/// (no `LT_ADMIN_PORT` configured), per the "no base domain match" rule.
pub(crate) async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if path == "/api/status" {
        return status_response(&state);
    }

    if let Some(id) = path.strip_prefix("/api/tunnels/").and_then(|r| r.strip_suffix("/status")) {
        return tunnel_status_response(&state, id);
    }

    if path == "/" && !query.split('&').any(|kv| kv == "new" || kv.starts_with("new=")) {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, state.config.landing.clone())
            .body(
                http_body_util::Empty::new()
                    .map_err(|never: std::convert::Infallible| match never {})
                    .boxed(),
            )
            .expect("static response is well-formed");
    }

    let requested_id = if path == "/" {
        None
    } else {
        Some(path.trim_start_matches('/').to_string())
    };

    if let Some(ref id) = requested_id {
        if !SUBDOMAIN_RE.is_match(id) {
            return json_response(
                StatusCode::FORBIDDEN,
                serde_json::json!({"message": INVALID_SUBDOMAIN_MESSAGE}),
            );
        }
    }

    let client_token = req
        .headers()
        .get("X-LT-Client-Token")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let forwarded_for = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let real_ip = req
        .headers()
        .get("X-Real-IP")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    if let Some(hmac) = &state.hmac {
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return empty_status(StatusCode::BAD_REQUEST),
        };

        let authorization = parts
            .headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok());
        let timestamp = parts.headers.get("X-Timestamp").and_then(|h| h.to_str().ok());
        let nonce = parts.headers.get("X-Nonce").and_then(|h| h.to_str().ok());

        if let Err(e) = hmac.validate(
            method.as_str(),
            &path,
            authorization,
            timestamp,
            nonce,
            &body_bytes,
            &state.nonce_cache,
        ) {
            let debug_mode = cfg!(debug_assertions);
            return json_response(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({
                    "error": "Authentication failed",
                    "message": e.client_message(debug_mode),
                }),
            );
        }
    }

    let source_ip = peer_addr.ip().to_string();
    let identifier = Identifier::from_request(
        client_token.as_deref(),
        &source_ip,
        forwarded_for.as_deref(),
        real_ip.as_deref(),
        state.config.trust_proxy,
    );

    create_tunnel_response(&state, requested_id, identifier, source_ip).await
}

async fn create_tunnel_response(
    state: &Arc<AppState>,
    requested_id: Option<String>,
    identifier: Identifier,
    source_ip: String,
) -> Response<BoxBody> {
    match state
        .clients
        .new_client(requested_id, identifier, source_ip)
        .await
    {
        Ok(result) => {
            let url = build_tunnel_url(state, &result.id, result.port);
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "id": result.id,
                    "port": result.port,
                    "max_conn_count": result.max_conn_count,
                    "url": url,
                }),
            )
        }
        Err(NewClientError::Reserved { id, remaining_secs }) => json_response(
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": "Subdomain reserved",
                "message": format!(
                    "Subdomain \"{id}\" is reserved by another client. Try again in {remaining_secs}s or use a different subdomain."
                ),
            }),
        ),
        Err(NewClientError::NoAvailablePorts) => {
            empty_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(NewClientError::Agent(e)) => {
            warn!(error = %e, "tunnel agent failed to start");
            empty_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn build_tunnel_url(state: &Arc<AppState>, id: &str, listen_port: u16) -> String {
    let scheme = if state.config.secure { "https" } else { "http" };
    let host = state.config.domain.clone().unwrap_or_else(|| "localhost".to_string());

    let default_port = if state.config.secure { 443 } else { 80 };
    let url_port = match (state.config.secure, state.config.http_proxy_port, state.config.https_proxy_port) {
        (true, _, Some(p)) => p,
        (false, Some(p), _) => p,
        _ => listen_port,
    };

    if url_port == default_port {
        format!("{scheme}://{id}.{host}")
    } else {
        format!("{scheme}://{id}.{host}:{url_port}")
    }
}

fn status_response(state: &Arc<AppState>) -> Response<BoxBody> {
    let mut sys = System::new_all();
    sys.refresh_all();
    let mem = sys
        .process(Pid::from_u32(std::process::id()))
        .map(|p| {
            serde_json::json!({
                "rss_bytes": p.memory(),
                "virtual_bytes": p.virtual_memory(),
            })
        })
        .unwrap_or_else(|| serde_json::json!({}));

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "tunnels": state.clients.tunnel_count(),
            "mem": mem,
        }),
    )
}

fn tunnel_status_response(state: &Arc<AppState>, id: &str) -> Response<BoxBody> {
    match state.clients.get_client(id) {
        Some(client) => {
            let stats = client.agent.stats();
            json_response(
                StatusCode::OK,
                serde_json::json!({"connected_sockets": stats.connected}),
            )
        }
        None => empty_status(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_regex_accepts_valid_ids() {
        assert!(SUBDOMAIN_RE.is_match("foobar"));
        assert!(SUBDOMAIN_RE.is_match("foo-bar-1"));
    }

    #[test]
    fn subdomain_regex_rejects_short_and_uppercase() {
        assert!(!SUBDOMAIN_RE.is_match("abc"));
        assert!(!SUBDOMAIN_RE.is_match("Foobar"));
    }

    #[test]
    fn subdomain_regex_rejects_oversized_ids() {
        let long = "a".repeat(64);
        assert!(!SUBDOMAIN_RE.is_match(&long));
    }
}
