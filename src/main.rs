//! LMS Sync Bridge
//!
//! Keeps a local host player in lock-step with a Logitech Media Server player.

use lms_sync_bridge::bridge::{Bridge, BRIDGE_GIT_SHA, BRIDGE_VERSION};
use lms_sync_bridge::player::{HeadlessHost, HostPlayer};
use lms_sync_bridge::{api, bus, config};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Host event buffer; the mirror drains it continuously
const HOST_EVENT_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lms_sync_bridge=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting LMS Sync Bridge v{} ({})",
        BRIDGE_VERSION,
        BRIDGE_GIT_SHA
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded from {}",
        config::get_config_dir().display()
    );

    // Create event bus
    let bus = bus::create_bus();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let (host_tx, host_rx) = mpsc::channel(HOST_EVENT_CAPACITY);
    let host: Arc<dyn HostPlayer> = Arc::new(HeadlessHost::new(host_tx));

    let api_config = config.api.clone();
    let discovery_timeout = config.discovery.timeout();
    let bridge = Arc::new(Bridge::connect(config, bus.clone(), host, &shutdown).await?);
    bridge.start(host_rx).await?;
    let fatal = bridge.fatal();

    let server = if api_config.enabled {
        let app = api::router(api::AppState::new(bridge.clone(), discovery_timeout));
        let addr = SocketAddr::from(([0, 0, 0, 0], api_config.port));
        tracing::info!("Listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    } else {
        None
    };

    let outcome = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        _ = fatal.cancelled() => Err(anyhow::anyhow!("bridge stopped after a fatal error")),
    };

    tracing::info!("Shutting down components...");
    bridge.shutdown().await;
    shutdown.cancel();

    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("API server error: {}", e),
            Err(e) => tracing::warn!("API server task failed: {}", e),
        }
    }

    tracing::info!("Shutdown complete");
    outcome
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
