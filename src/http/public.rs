//! Public plane: Host-header routing to tunnel clients, on the port tunnel
//! URLs point at.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::{Client, ForwardError};
use crate::http::{json_response, subdomain_of, BoxBody};
use crate::state::AppState;

pub async fn run(
    state: Arc<AppState>,
    bind_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "public plane listening");

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
                        warn!(error = %e, "public plane accept failed");
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
                        .preserve_header_case(true)
                        .title_case_headers(false)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(peer = %peer_addr, error = %e, "public connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    if req.uri().path() == "/healthz" {
        return json_response(StatusCode::OK, serde_json::json!({"status": "healthy"}));
    }

    let host = match req.headers().get(hyper::header::HOST).and_then(|h| h.to_str().ok()) {
        Some(h) => h.to_string(),
        None => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "Host header is required"}),
            )
        }
    };

    let base_domain = match &state.config.domain {
        Some(d) => d.clone(),
        None => return crate::http::admin::route(state, req, peer_addr).await,
    };

    let subdomain = match subdomain_of(&host, &base_domain) {
        Some(s) => s,
        None => return crate::http::admin::route(state, req, peer_addr).await,
    };

    let client = match state.clients.get_client(&subdomain) {
        Some(c) => c,
        None => return Client::not_found_response(),
    };

    // Upgrades get to wait out a grace period (bounded by their own timeout)
    // for the client to come back online; only plain requests fail fast.
    if is_upgrade_request(&req) {
        return handle_upgrade_route(state, client, req, peer_addr).await;
    }

    if client.is_in_grace() {
        let remaining_ms = client.grace_period_remaining_ms().unwrap_or(0);
        let retry_secs = remaining_ms.div_ceil(1000).max(1);
        return Client::grace_unavailable_response(retry_secs);
    }

    if !client.has_available_sockets() {
        return Client::unavailable_response(state.config.retry_after);
    }

    let timeout = Duration::from_millis(state.config.request_timeout_ms);
    match client.handle_request(req, timeout).await {
        Ok(resp) => resp,
        Err(ForwardError::NoSocketsAvailable) => {
            Client::unavailable_response(state.config.retry_after)
        }
        Err(ForwardError::Timeout) => Client::unavailable_response(state.config.retry_after),
        Err(e) => {
            warn!(error = %e, "forwarding error");
            Client::unavailable_response(state.config.retry_after)
        }
    }
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    req.headers().get(hyper::header::UPGRADE).is_some()
}

async fn handle_upgrade_route(
    state: Arc<AppState>,
    client: Arc<crate::client::Client>,
    req: Request<Incoming>,
    _peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();
    let headers = req.headers().clone();

    let ws_timeout = Duration::from_millis(state.config.websocket_timeout_ms);
    let check_interval = Duration::from_millis(state.config.socket_check_interval_ms);

    if !wait_for_capacity(&client, ws_timeout, check_interval).await {
        return Client::unavailable_response(state.config.retry_after);
    }

    let raw_head = build_raw_request_head(&method, &uri, version, &headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = client.handle_upgrade(upgraded, raw_head, ws_timeout).await {
                    debug!(error = %e, "upgrade forwarding ended");
                }
            }
            Err(e) => {
                debug!(error = %e, "upgrade negotiation failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .body(
            http_body_util::Empty::new()
                .map_err(|never: std::convert::Infallible| match never {})
                .boxed(),
        )
        .expect("static response is well-formed")
}

/// Wait for an online, socket-available client, polling at
/// `check_interval`, bounded by `min(timeout, grace_remaining)` when the
/// client is currently in grace.
async fn wait_for_capacity(
    client: &Arc<crate::client::Client>,
    timeout: Duration,
    check_interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.is_online() && client.has_available_sockets() {
            return true;
        }
        if client.state() == crate::client::ClientState::Closed {
            return false;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(check_interval).await;
    }
}

fn build_raw_request_head(
    method: &hyper::Method,
    uri: &hyper::Uri,
    version: hyper::Version,
    headers: &hyper::HeaderMap,
) -> Vec<u8> {
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let version_str = match version {
        hyper::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let mut head = format!("{method} {path} {version_str}\r\n");
    for (name, value) in headers {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str().unwrap_or(""));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}
