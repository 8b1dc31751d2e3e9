mod agent;
mod auth;
mod client;
mod config;
mod http;
mod identifier;
mod manager;
mod nonce;
mod portpool;
mod state;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let hmac_secret = config.validate().map_err(|e| {
        eprintln!("fatal: {e}");
        e
    })?;

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        admin_port = config.effective_admin_port(),
        "lt-server starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        hmac_secret,
        shutdown_rx.clone(),
    ));

    let sweep_handle = state.spawn_nonce_sweep();

    let public_addr: std::net::SocketAddr =
        format!("{}:{}", config.address, config.port).parse()?;
    let public_task = tokio::spawn(http::public::run(
        Arc::clone(&state),
        public_addr,
        shutdown_rx.clone(),
    ));

    let admin_task = if config.admin_is_separate() {
        let admin_addr: std::net::SocketAddr = format!(
            "{}:{}",
            config.admin_address,
            config.effective_admin_port()
        )
        .parse()?;
        Some(tokio::spawn(http::admin::run(
            Arc::clone(&state),
            admin_addr,
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    wait_for_shutdown().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);

    sweep_handle.abort();

    if let Err(e) = public_task.await? {
        error!(error = %e, "public plane exited with error");
    }
    if let Some(admin_task) = admin_task {
        if let Err(e) = admin_task.await? {
            error!(error = %e, "admin plane exited with error");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
