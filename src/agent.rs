//! TunnelAgent: the per-client TCP listener and socket pool that backs one
//! tunnel. Tunnel clients dial in on the assigned port; each accepted socket
//! becomes a unit of forwarding capacity handed out FIFO to waiters.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::Response;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// An idle socket sitting in the pool, not yet handed to a caller. Watched
/// by its own task (see [`TunnelAgent::watch_idle_socket`]) so a tunnel
/// client that dies while holding sockets open-but-unused is still detected.
struct IdleEntry {
    id: u64,
    claim_tx: oneshot::Sender<oneshot::Sender<PooledSocket>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent already listening")]
    AlreadyStarted,
    #[error("agent is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentStats {
    pub connected: u32,
    pub rejected: u64,
    pub available: usize,
    pub waiting: usize,
}

/// A single idle socket handed out to a waiter or popped by a forwarding call.
pub struct PooledSocket {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

struct Inner {
    idle: VecDeque<IdleEntry>,
    waiters: VecDeque<oneshot::Sender<PooledSocket>>,
    closed: bool,
}

/// Per-client socket pool. One Agent is embedded in exactly one Client for
/// its entire life.
pub struct TunnelAgent {
    max_sockets: u32,
    connected: AtomicU32,
    rejected: AtomicU64,
    inner: Mutex<Inner>,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    listen_started: std::sync::atomic::AtomicBool,
    next_socket_id: AtomicU64,
}

impl TunnelAgent {
    pub fn new(max_sockets: u32) -> Arc<Self> {
        let (online_tx, online_rx) = watch::channel(false);
        Arc::new(Self {
            max_sockets,
            connected: AtomicU32::new(0),
            rejected: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
            online_tx,
            online_rx,
            listen_started: std::sync::atomic::AtomicBool::new(false),
            next_socket_id: AtomicU64::new(0),
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online_rx.clone()
    }

    pub fn stats(&self) -> AgentStats {
        let inner = self.inner.lock();
        AgentStats {
            connected: self.connected.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            available: inner.idle.len(),
            waiting: inner.waiters.len(),
        }
    }

    pub fn has_available_sockets(&self) -> bool {
        !self.inner.lock().idle.is_empty()
    }

    /// Bind the tunnel-client-facing listener and run its accept loop until
    /// `shutdown` fires or the agent is destroyed. Idempotent misuse (a
    /// second call) fails fast rather than binding twice.
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u16, AgentError> {
        if self
            .listen_started
            .swap(true, Ordering::SeqCst)
        {
            return Err(AgentError::AlreadyStarted);
        }

        let listener = TcpListener::bind(addr).await?;
        let bound_port = listener.local_addr()?.port();

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "tunnel listener accept failed");
                                continue;
                            }
                        };
                        if agent.inner.lock().closed {
                            break;
                        }
                        agent.clone().on_accept(stream, peer_addr).await;
                    }
                }
            }
            debug!("tunnel agent accept loop exited");
        });

        Ok(bound_port)
    }

    async fn on_accept(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        let current = self.connected.load(Ordering::Relaxed);
        if current >= self.max_sockets {
            let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            if rejected == 1 || rejected % 10 == 0 {
                warn!(peer = %peer_addr, rejected, "tunnel socket rejected: max sockets reached");
            }
            let available = self.inner.lock().idle.len();
            let waiting = self.inner.lock().waiters.len();
            let _ = write_too_many_connections(
                &mut stream,
                self.max_sockets,
                current,
                available as u32,
                waiting as u32,
            )
            .await;
            return;
        }

        let was_zero = self.connected.fetch_add(1, Ordering::Relaxed) == 0;
        if was_zero {
            let _ = self.online_tx.send(true);
            info!("tunnel agent online");
        }

        let waiter = {
            let mut inner = self.inner.lock();
            inner.waiters.pop_front()
        };

        if let Some(waiter) = waiter {
            let pooled = PooledSocket { stream, peer_addr };
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                if waiter.send(pooled).is_err() {
                    agent.on_socket_dropped();
                }
            });
        } else {
            // No one is waiting for this socket yet: park it in the idle
            // pool and hand its lifetime to a watcher task, so a tunnel
            // client that crashes while sitting idle is still noticed.
            let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
            let (claim_tx, claim_rx) = oneshot::channel();
            self.inner.lock().idle.push_back(IdleEntry { id, claim_tx });
            let agent = Arc::clone(&self);
            tokio::spawn(agent.watch_idle_socket(id, stream, peer_addr, claim_rx));
        }
    }

    /// Owns one idle socket until it is either claimed by
    /// [`TunnelAgent::create_connection`] or observed to close/error while
    /// still sitting unused. Either way this task is the sole place that
    /// decides the socket's fate, so `idle`/`connected` never drift.
    async fn watch_idle_socket(
        self: Arc<Self>,
        id: u64,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        claim_rx: oneshot::Receiver<oneshot::Sender<PooledSocket>>,
    ) {
        tokio::select! {
            claimed = claim_rx => {
                match claimed {
                    Ok(responder) => {
                        let _ = responder.send(PooledSocket { stream, peer_addr });
                    }
                    Err(_) => {
                        // Our idle entry was dropped (agent destroyed) before
                        // anyone claimed it.
                        self.on_socket_dropped();
                    }
                }
            }
            readiness = stream.readable() => {
                self.remove_idle(id);
                match readiness {
                    Ok(()) => {
                        let mut probe = [0u8; 1];
                        match stream.try_read(&mut probe) {
                            Ok(0) => debug!(peer = %peer_addr, "idle tunnel socket closed"),
                            Ok(_) => warn!(peer = %peer_addr, "idle tunnel socket sent unexpected data, dropping"),
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(e) => debug!(peer = %peer_addr, error = %e, "idle tunnel socket read error"),
                        }
                    }
                    Err(e) => debug!(peer = %peer_addr, error = %e, "idle tunnel socket readiness error"),
                }
                self.on_socket_dropped();
            }
        }
    }

    /// Drop an idle entry if it's still parked (no-op if it was already
    /// claimed or removed by `destroy`).
    fn remove_idle(&self, id: u64) {
        self.inner.lock().idle.retain(|entry| entry.id != id);
    }

    /// Called by the holder of a pooled socket once it is no longer usable
    /// (the forwarding request finished or its connection died).
    pub fn on_socket_dropped(&self) {
        let remaining = self.connected.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            let _ = self.online_tx.send(false);
            info!("tunnel agent offline");
        }
    }

    /// Request an idle socket, waiting FIFO behind any already-queued waiter
    /// if the pool is currently empty. If the idle entry we popped turns out
    /// to already be dead (its watcher lost the race and tore it down),
    /// retry against the next one rather than failing the whole request.
    pub async fn create_connection(&self) -> Result<PooledSocket, AgentError> {
        loop {
            enum Next {
                Claim(IdleEntry),
                Wait(oneshot::Receiver<PooledSocket>),
            }

            let next = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(AgentError::Closed);
                }
                if let Some(entry) = inner.idle.pop_front() {
                    Next::Claim(entry)
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    Next::Wait(rx)
                }
            };

            match next {
                Next::Claim(entry) => {
                    let (resp_tx, resp_rx) = oneshot::channel();
                    if entry.claim_tx.send(resp_tx).is_err() {
                        continue;
                    }
                    return resp_rx.await.map_err(|_| AgentError::Closed);
                }
                Next::Wait(rx) => {
                    return rx.await.map_err(|_| AgentError::Closed);
                }
            }
        }
    }

    /// Close the listener and fail every pending waiter. Sockets already
    /// handed out are left for their owners to finish.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.idle.clear();
        inner.waiters.clear();
    }
}

async fn write_too_many_connections(
    stream: &mut TcpStream,
    max_sockets: u32,
    current: u32,
    available: u32,
    waiting: u32,
) -> std::io::Result<()> {
    let body = serde_json::json!({
        "error": "Too Many Connections",
        "max_sockets": max_sockets,
        "current_sockets": current,
    });
    let body_bytes = Bytes::from(body.to_string());

    let response = Response::builder()
        .status(429)
        .header("Content-Type", "application/json")
        .header("X-LT-Max-Sockets", max_sockets.to_string())
        .header("X-LT-Current-Sockets", current.to_string())
        .header("X-LT-Available-Sockets", available.to_string())
        .header("X-LT-Waiting-Requests", waiting.to_string())
        .header("Content-Length", body_bytes.len().to_string())
        .body(())
        .expect("static response is well-formed");

    let mut raw = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        raw.push_str(name.as_str());
        raw.push_str(": ");
        raw.push_str(value.to_str().unwrap_or(""));
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes()).await?;
    stream.write_all(&body_bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream as ClientStream;

    #[tokio::test]
    async fn online_offline_transitions_on_connect_count() {
        let agent = TunnelAgent::new(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = agent
            .listen("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        assert!(!agent.is_online());

        let _client = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(agent.is_online());
    }

    #[tokio::test]
    async fn rejects_beyond_max_sockets() {
        let agent = TunnelAgent::new(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = agent
            .listen("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        let _first = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut second = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 128];
        let n = second.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 429"));
    }

    #[tokio::test]
    async fn idle_socket_close_is_detected_and_flips_offline() {
        let agent = TunnelAgent::new(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = agent
            .listen("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        let client = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(agent.is_online());
        assert!(agent.has_available_sockets());

        // The tunnel client crashes while this socket is idle, never having
        // been checked out for a request.
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(!agent.is_online());
        assert!(!agent.has_available_sockets());
    }

    #[tokio::test]
    async fn idle_socket_can_be_claimed_via_create_connection() {
        let agent = TunnelAgent::new(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = agent
            .listen("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        let _client = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let pooled = agent.create_connection().await.unwrap();
        assert_eq!(pooled.peer_addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn double_listen_fails() {
        let agent = TunnelAgent::new(1);
        let (_tx1, rx1) = watch::channel(false);
        let (_tx2, rx2) = watch::channel(false);
        agent
            .listen("127.0.0.1:0".parse().unwrap(), rx1)
            .await
            .unwrap();
        assert!(matches!(
            agent.listen("127.0.0.1:0".parse().unwrap(), rx2).await,
            Err(AgentError::AlreadyStarted)
        ));
    }
}
