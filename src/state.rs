//! Shared application state passed to both HTTP front-ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::auth::HmacAuthenticator;
use crate::config::Config;
use crate::manager::ClientManager;
use crate::nonce::NonceCache;

/// Central state shared by the public and admin HTTP planes.
pub struct AppState {
    pub config: Arc<Config>,
    pub clients: Arc<ClientManager>,
    pub nonce_cache: NonceCache,
    pub hmac: Option<HmacAuthenticator>,
}

impl AppState {
    /// Build application state from a validated config. `hmac_secret` is the
    /// value returned by `Config::validate` (already length-checked).
    pub fn new(config: Arc<Config>, hmac_secret: Option<String>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let bind_address = config.address.clone();
        let clients = ClientManager::new(Arc::clone(&config), bind_address, shutdown_rx);

        let nonce_cache = NonceCache::new(Duration::from_secs(config.hmac_nonce_cache_ttl_secs));

        let hmac = hmac_secret.map(|secret| {
            HmacAuthenticator::new(
                secret,
                config.hmac_timestamp_tolerance_secs,
                config.hmac_nonce_threshold_secs,
                config.hmac_nonce_cache_ttl_secs,
            )
        });

        Self {
            config,
            clients,
            nonce_cache,
            hmac,
        }
    }

    /// Spawn the periodic nonce-cache sweep. Returns the task handle so the
    /// caller can abort it on shutdown.
    pub fn spawn_nonce_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let interval = Duration::from_millis(state.config.nonce_cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.nonce_cache.sweep();
            }
        })
    }
}
