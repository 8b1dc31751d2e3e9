//! Client: one tunnel session's state machine and request/upgrade forwarding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, TunnelAgent};
use crate::config::Config;
use crate::identifier::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    PendingFirstConnect,
    Online,
    OfflineGrace,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no sockets available")]
    NoSocketsAvailable,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// One tunnel session. Owns exactly one [`TunnelAgent`] for its entire life.
pub struct Client {
    pub id: String,
    pub identifier: Identifier,
    pub source_ip: String,
    pub created_at: Instant,
    pub agent: Arc<TunnelAgent>,
    /// Pool-allocated port, if the server is running with `LT_PORT_RANGE_*`
    /// configured. `None` means the tunnel bound an OS-assigned ephemeral
    /// port that has no pool entry to release.
    pub pooled_port: Option<u16>,
    config: Arc<Config>,
    state: Mutex<ClientState>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    grace_deadline_ms: AtomicU64,
    closed: AtomicBool,
    closed_tx: tokio::sync::watch::Sender<bool>,
    closed_rx: tokio::sync::watch::Receiver<bool>,
}

impl Client {
    pub fn new(
        id: String,
        identifier: Identifier,
        source_ip: String,
        agent: Arc<TunnelAgent>,
        config: Arc<Config>,
        pooled_port: Option<u16>,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let client = Arc::new(Self {
            id,
            identifier,
            source_ip,
            created_at: Instant::now(),
            agent,
            pooled_port,
            config,
            state: Mutex::new(ClientState::PendingFirstConnect),
            grace_timer: Mutex::new(None),
            grace_deadline_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
            closed_rx,
        });

        let watcher = Arc::clone(&client);
        tokio::spawn(async move {
            watcher.drive_online_offline().await;
        });

        client
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn is_online(&self) -> bool {
        matches!(self.state(), ClientState::Online | ClientState::PendingFirstConnect)
            && self.agent.is_online()
    }

    pub fn is_in_grace(&self) -> bool {
        self.state() == ClientState::OfflineGrace
    }

    /// Subscribe to this client's terminal close signal. Fires exactly once,
    /// when `close()` runs; used by `ClientManager` to reap its registry
    /// entry and release the pooled port as soon as a client closes on its
    /// own (grace expiry), not only when a later request for the same id
    /// happens to evict it.
    pub fn subscribe_closed(&self) -> tokio::sync::watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn has_available_sockets(&self) -> bool {
        self.agent.has_available_sockets()
    }

    /// Milliseconds remaining until this client closes, if currently in grace.
    pub fn grace_period_remaining_ms(&self) -> Option<u64> {
        if !self.is_in_grace() {
            return None;
        }
        let deadline = self.grace_deadline_ms.load(Ordering::Relaxed);
        let now = now_ms();
        Some(deadline.saturating_sub(now))
    }

    /// Background task that reacts to the agent's online/offline signal,
    /// driving the state machine and arming/disarming the grace timer. This
    /// single task owns every state transition, so it never races itself.
    async fn drive_online_offline(self: Arc<Self>, ) {
        let mut online_rx = self.agent.subscribe_online();
        loop {
            if online_rx.changed().await.is_err() {
                break;
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let online = *online_rx.borrow();
            if online {
                self.cancel_grace_timer();
                *self.state.lock() = ClientState::Online;
            } else {
                let was_closed = self.state() == ClientState::Closed;
                if was_closed {
                    continue;
                }
                *self.state.lock() = ClientState::OfflineGrace;
                let grace_ms = self.config.grace_period_ms();
                self.arm_grace_timer(grace_ms);
            }
        }
    }

    fn arm_grace_timer(self: &Arc<Self>, grace_ms: u64) {
        self.grace_deadline_ms
            .store(now_ms() + grace_ms, Ordering::Relaxed);
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(grace_ms)).await;
            client.fire_grace_expiry();
        });
        let mut slot = self.grace_timer.lock();
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(handle);
    }

    fn cancel_grace_timer(&self) {
        if let Some(handle) = self.grace_timer.lock().take() {
            handle.abort();
        }
    }

    fn fire_grace_expiry(self: Arc<Self>) {
        let mut state = self.state.lock();
        if *state == ClientState::OfflineGrace {
            *state = ClientState::Closed;
            drop(state);
            self.close();
        }
    }

    /// Idempotent terminal transition. Destroys the agent, cancels any
    /// pending grace timer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ClientState::Closed;
        self.cancel_grace_timer();
        self.agent.destroy();
        let _ = self.closed_tx.send(true);
        info!(client_id = %self.id, "client closed");
    }

    /// Forward one HTTP request through a socket borrowed from the agent.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        request_timeout: Duration,
    ) -> Result<Response<BoxBody>, ForwardError> {
        let pooled = self.agent.create_connection().await.map_err(|e| match e {
            AgentError::Closed => ForwardError::NoSocketsAvailable,
            _ => ForwardError::NoSocketsAvailable,
        })?;

        let io = TokioIo::new(pooled.stream);
        let handshake = hyper::client::conn::http1::handshake(io);
        let (mut sender, conn) = match timeout(request_timeout, handshake).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.agent.on_socket_dropped();
                return Err(ForwardError::Hyper(e));
            }
            Err(_) => {
                self.agent.on_socket_dropped();
                return Err(ForwardError::Timeout);
            }
        };

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "forwarding connection closed");
            }
        });

        let result = timeout(request_timeout, sender.send_request(req)).await;
        self.agent.on_socket_dropped();

        match result {
            Ok(Ok(resp)) => {
                let (parts, body) = resp.into_parts();
                let boxed = body.map_err(|e| e).boxed();
                Ok(Response::from_parts(parts, boxed))
            }
            Ok(Err(e)) => Err(ForwardError::Hyper(e)),
            Err(_) => Err(ForwardError::Timeout),
        }
    }

    /// Forward a WebSocket-style upgrade by replaying the original request
    /// line/headers onto a borrowed agent socket, then piping bytes until
    /// either side closes.
    pub async fn handle_upgrade(
        &self,
        mut upgraded: Upgraded,
        raw_request_head: Vec<u8>,
        upgrade_timeout: Duration,
    ) -> Result<(), ForwardError> {
        let pooled = timeout(upgrade_timeout, self.agent.create_connection())
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(|_| ForwardError::NoSocketsAvailable)?;

        let mut target = pooled.stream;
        use tokio::io::AsyncWriteExt;
        if let Err(e) = target.write_all(&raw_request_head).await {
            self.agent.on_socket_dropped();
            return Err(ForwardError::Io(e));
        }

        let result = tokio::io::copy_bidirectional(&mut upgraded, &mut target).await;
        self.agent.on_socket_dropped();
        result.map(|_| ()).map_err(ForwardError::Io)
    }

    pub fn not_found_response() -> Response<BoxBody> {
        empty_response(StatusCode::NOT_FOUND, "Tunnel Not Found")
    }

    pub fn unavailable_response(retry_after_secs: u64) -> Response<BoxBody> {
        let mut resp = empty_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
        );
        resp.headers_mut().insert(
            "Retry-After",
            retry_after_secs.to_string().parse().unwrap(),
        );
        resp
    }

    pub fn grace_unavailable_response(retry_after_secs: u64) -> Response<BoxBody> {
        let mut resp = empty_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Temporarily Unavailable",
        );
        resp.headers_mut().insert(
            "Retry-After",
            retry_after_secs.to_string().parse().unwrap(),
        );
        resp
    }
}

fn empty_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    let boxed = Full::new(Bytes::from(body.to_string()))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(boxed)
        .unwrap_or_else(|_| {
            Response::new(
                Empty::<Bytes>::new()
                    .map_err(|never: std::convert::Infallible| match never {})
                    .boxed(),
            )
        })
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::parse_from(["lt-server"]))
    }

    #[tokio::test]
    async fn new_client_starts_pending_then_goes_online() {
        let agent = TunnelAgent::new(4);
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let port = agent.listen(addr, rx).await.unwrap();

        let client = Client::new(
            "myapp".to_string(),
            Identifier::Ip("1.2.3.4".to_string()),
            "1.2.3.4".to_string(),
            Arc::clone(&agent),
            test_config(),
            None,
        );
        assert_eq!(client.state(), ClientState::PendingFirstConnect);

        let _sock = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ClientState::Online);
    }

    #[tokio::test]
    async fn close_fires_the_closed_signal() {
        let agent = TunnelAgent::new(1);
        let client = Client::new(
            "id".to_string(),
            Identifier::Ip("1.1.1.1".to_string()),
            "1.1.1.1".to_string(),
            agent,
            test_config(),
            None,
        );
        let mut closed_rx = client.subscribe_closed();
        client.close();
        closed_rx.changed().await.unwrap();
        assert!(*closed_rx.borrow());
    }

    #[test]
    fn close_is_idempotent() {
        let agent = TunnelAgent::new(1);
        let client = Client::new(
            "id".to_string(),
            Identifier::Ip("1.1.1.1".to_string()),
            "1.1.1.1".to_string(),
            agent,
            test_config(),
            None,
        );
        client.close();
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
    }
}
