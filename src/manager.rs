//! ClientManager: the subdomain registry, reservation policy, and port
//! allocator that ties a public request to the Client/Agent pair serving it.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tracing::info;

use crate::agent::TunnelAgent;
use crate::client::{Client, ClientState};
use crate::config::Config;
use crate::identifier::Identifier;
use crate::portpool::{PortPool, PortPoolError};

#[derive(Debug, thiserror::Error)]
pub enum NewClientError {
    #[error("Subdomain \"{id}\" is reserved by another client. Try again in {remaining_secs}s or use a different subdomain.")]
    Reserved { id: String, remaining_secs: u64 },
    #[error("no available ports")]
    NoAvailablePorts,
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),
}

pub struct NewClientResult {
    pub id: String,
    pub port: u16,
    pub max_conn_count: u32,
}

/// Registry of active tunnels, keyed by subdomain id.
pub struct ClientManager {
    self_ref: Weak<ClientManager>,
    clients: DashMap<String, Arc<Client>>,
    port_pool: Option<PortPool>,
    config: Arc<Config>,
    bind_address: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClientManager {
    pub fn new(
        config: Arc<Config>,
        bind_address: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let port_pool = match (config.port_range_start, config.port_range_end) {
            (Some(start), Some(end)) => Some(PortPool::new(start, end)),
            _ => None,
        };
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            clients: DashMap::new(),
            port_pool,
            config,
            bind_address,
            shutdown_rx,
        })
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn tunnel_count(&self) -> usize {
        self.clients.len()
    }

    /// Resolve a tunnel-creation request into a live Client, following the
    /// six-step reservation algorithm: reconnection by matching identifier
    /// reclaims a subdomain in grace, a mismatched identifier either fails
    /// (strict mode) or gets minted a fresh random id (silent mode), and an
    /// online same-owner rebind replaces the old client outright.
    pub async fn new_client(
        &self,
        requested_id: Option<String>,
        identifier: Identifier,
        source_ip: String,
    ) -> Result<NewClientResult, NewClientError> {
        let mut id = requested_id.unwrap_or_else(random_id);

        loop {
            let existing = self.clients.get(&id).map(|e| Arc::clone(e.value()));

            match existing {
                None => break,
                Some(existing_client) => {
                    if existing_client.is_in_grace() {
                        if existing_client.identifier == identifier {
                            self.remove_client(&existing_client.id);
                            break;
                        } else if self.config.ip_validation_strict {
                            let remaining = existing_client
                                .grace_period_remaining_ms()
                                .unwrap_or(0)
                                / 1000;
                            return Err(NewClientError::Reserved {
                                id,
                                remaining_secs: remaining,
                            });
                        } else {
                            id = random_id();
                            continue;
                        }
                    } else if existing_client.state() == ClientState::Closed {
                        // Closed but not yet reaped; treat as free.
                        self.remove_client(&existing_client.id);
                        break;
                    } else {
                        // Online, or pending its first connection: same-owner
                        // rebind closes the old client, otherwise a fresh
                        // random id is minted rather than colliding.
                        if existing_client.identifier == identifier {
                            self.remove_client(&existing_client.id);
                            break;
                        } else {
                            id = random_id();
                            continue;
                        }
                    }
                }
            }
        }

        let pooled_port = match &self.port_pool {
            Some(pool) => Some(
                pool.acquire()
                    .map_err(|PortPoolError::Exhausted| NewClientError::NoAvailablePorts)?,
            ),
            None => None,
        };
        let bind_port = pooled_port.unwrap_or(0);

        let agent = TunnelAgent::new(self.config.max_sockets);
        let client = Client::new(
            id.clone(),
            identifier,
            source_ip,
            Arc::clone(&agent),
            Arc::clone(&self.config),
            pooled_port,
        );

        // Insert before the async listen so two concurrent requests for the
        // same id cannot both succeed.
        self.clients.insert(id.clone(), Arc::clone(&client));

        let bind_addr: SocketAddr = format!("{}:{}", self.bind_address, bind_port)
            .parse()
            .expect("bind_address + port form a valid socket address");

        match agent.listen(bind_addr, self.shutdown_rx.clone()).await {
            Ok(bound_port) => {
                info!(id = %id, port = bound_port, "tunnel created");
                self.spawn_close_reaper(id.clone(), Arc::clone(&client));
                Ok(NewClientResult {
                    id,
                    port: bound_port,
                    max_conn_count: self.config.max_sockets,
                })
            }
            Err(e) => {
                self.clients.remove(&id);
                if let (Some(pool), Some(port)) = (&self.port_pool, pooled_port) {
                    pool.release(port);
                }
                Err(NewClientError::Agent(e))
            }
        }
    }

    /// Remove a client from the registry and release its port, if pooled.
    /// Idempotent: removing an id twice is a no-op the second time.
    pub fn remove_client(&self, id: &str) {
        if let Entry::Occupied(entry) = self.clients.entry(id.to_string()) {
            let client = entry.get().clone();
            entry.remove();
            client.close();
            if let (Some(pool), Some(port)) = (&self.port_pool, client.pooled_port) {
                pool.release(port);
            }
        }
    }

    /// Remove `id` only if the registry still points at `expected` — guards
    /// against reaping a client that already got replaced by a rebind under
    /// the same id.
    fn remove_client_if_current(&self, id: &str, expected: &Arc<Client>) {
        if let Entry::Occupied(entry) = self.clients.entry(id.to_string()) {
            if Arc::ptr_eq(entry.get(), expected) {
                let client = entry.get().clone();
                entry.remove();
                client.close();
                if let (Some(pool), Some(port)) = (&self.port_pool, client.pooled_port) {
                    pool.release(port);
                }
            }
        }
    }

    /// Wire `client.close()` (grace-period expiry, or anything else that
    /// closes it directly) back into the registry: as soon as the client
    /// closes on its own, reap its entry and release its pooled port,
    /// rather than waiting for some future request to the same id.
    fn spawn_close_reaper(&self, id: String, client: Arc<Client>) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let mut closed_rx = client.subscribe_closed();
        tokio::spawn(async move {
            if closed_rx.changed().await.is_err() {
                return;
            }
            if *closed_rx.borrow() {
                manager.remove_client_if_current(&id, &client);
            }
        });
    }

    pub fn stats(&self) -> usize {
        self.clients.len()
    }
}

fn random_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("t-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn manager() -> Arc<ClientManager> {
        let config = Arc::new(Config::parse_from(["lt-server"]));
        let (_tx, rx) = watch::channel(false);
        ClientManager::new(config, "127.0.0.1".to_string(), rx)
    }

    #[tokio::test]
    async fn creates_new_client_with_requested_id() {
        let manager = manager();
        let result = manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Ip("1.2.3.4".to_string()),
                "1.2.3.4".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(result.id, "myapp");
        assert!(manager.has_client("myapp"));
    }

    #[tokio::test]
    async fn client_close_reaps_the_registry_entry() {
        let manager = manager();
        manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Ip("1.2.3.4".to_string()),
                "1.2.3.4".to_string(),
            )
            .await
            .unwrap();
        assert!(manager.has_client("myapp"));

        let client = manager.get_client("myapp").unwrap();
        client.close();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!manager.has_client("myapp"));
    }

    #[tokio::test]
    async fn online_client_with_different_identifier_gets_random_id() {
        let manager = manager();
        manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Ip("1.2.3.4".to_string()),
                "1.2.3.4".to_string(),
            )
            .await
            .unwrap();

        let client = manager.get_client("myapp").unwrap();
        let mut rx = client.agent.subscribe_online();
        let _ = rx.changed().await;

        let result = manager
            .new_client(
                Some("myapp".to_string()),
                Identifier::Ip("9.9.9.9".to_string()),
                "9.9.9.9".to_string(),
            )
            .await;
        // Agent never went online (no socket connected) so this falls
        // through the "closed but not reaped" branch and reclaims "myapp".
        assert!(result.is_ok());
    }
}
