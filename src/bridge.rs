//! Bridge wiring: finds the server, resolves the player, builds the shared
//! state and starts the CLI listener, the reconciler and the host mirror.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::handle::{AdapterHandle, RetryConfig};
use crate::adapters::lms::{LmsEndpoint, LmsError, LmsRpc};
use crate::adapters::lms_cli::{CliEvent, CliListener, CliSettings, NotificationHandlers};
use crate::adapters::lms_discovery;
use crate::bus::SharedBus;
use crate::config::Config;
use crate::coordinator::{ComponentCoordinator, ComponentStatus};
use crate::player::{HostEvent, HostMedia, HostPlayer, LocalPlayer, LocalSnapshot};
use crate::sync::{Mirror, Reconciler, ServerState, ServerStateView, SyncGuard};

pub const BRIDGE_VERSION: &str = env!("BRIDGE_VERSION");
pub const BRIDGE_GIT_SHA: &str = env!("BRIDGE_GIT_SHA");

/// Where the JSON-RPC and CLI endpoints live
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub cli_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub server: ServerAddress,
    pub remote: ServerStateView,
    pub local: LocalSnapshot,
    pub media: HostMedia,
    pub auto_powered_off: bool,
    pub busy: bool,
    pub components: Vec<ComponentStatus>,
}

pub struct Bridge {
    config: Config,
    address: ServerAddress,
    bus: SharedBus,
    server: Arc<ServerState>,
    local: Arc<LocalPlayer>,
    guard: Arc<SyncGuard>,
    reconciler: Arc<Reconciler>,
    wake: Arc<Notify>,
    coordinator: ComponentCoordinator,
    /// Cancelled when a component fails in a way the bridge cannot recover from
    fatal: CancellationToken,
}

/// Configured host, or the first server answering discovery.
///
/// Rescans until a server answers or `shutdown` fires.
pub async fn resolve_server(config: &Config, shutdown: &CancellationToken) -> Result<ServerAddress> {
    if let Some(host) = config.lms.host.as_ref().filter(|h| !h.is_empty()) {
        return Ok(ServerAddress {
            host: host.clone(),
            port: config.lms.port,
            cli_port: config.lms.cli_port,
        });
    }

    info!("No LMS host configured, discovering");
    loop {
        match lms_discovery::scan(config.discovery.timeout()).await {
            Ok(servers) => {
                if let Some(first) = servers.into_iter().next() {
                    info!(
                        "Using LMS {} at {}:{}",
                        first.name.as_deref().unwrap_or("(unnamed)"),
                        first.host,
                        first.port
                    );
                    return Ok(ServerAddress {
                        host: first.host,
                        port: first.port,
                        cli_port: config.lms.cli_port,
                    });
                }
            }
            Err(e) => warn!("Discovery failed: {:#}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Err(anyhow!("shutdown while discovering LMS")),
            _ = tokio::time::sleep(config.discovery.rescan_interval()) => {}
        }
    }
}

/// Configured player, or the first one the server lists.
///
/// Asks again every `retry` while the server has no player or cannot be
/// reached. Rejected credentials and `shutdown` end the wait.
pub async fn resolve_player(
    rpc: &LmsRpc,
    configured: Option<&str>,
    retry: Duration,
    shutdown: &CancellationToken,
) -> Result<String> {
    if let Some(id) = configured.filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    loop {
        match rpc.get_players().await {
            Ok(players) => {
                if let Some(first) = players.into_iter().next() {
                    info!("Bridging player {} ({})", first.name, first.playerid);
                    return Ok(first.playerid);
                }
                info!("LMS at {} reports no players yet", rpc.host());
            }
            Err(e) if e.is_fatal() => return Err(e).context("listing players"),
            Err(e) if e.is_unreachable() => warn!("LMS not reachable yet: {}", e),
            Err(e) => warn!("Listing players failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Err(anyhow!("shutdown while waiting for an LMS player")),
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// CLI handlers: anything that changes the bridged player's playlist, power
/// or connection triggers an immediate reconciliation tick.
pub fn notification_handlers(player_id: &str, wake: Arc<Notify>) -> NotificationHandlers {
    let mut handlers = NotificationHandlers::new();
    for prefix in ["playlist", "power", "client"] {
        let player_id = player_id.to_string();
        let wake = wake.clone();
        handlers.register(prefix, move |notification| {
            if notification.player_id != player_id {
                return;
            }
            if let CliEvent::Unknown = notification.kind() {
                return;
            }
            wake.notify_one();
        });
    }
    handlers
}

impl Bridge {
    pub async fn connect(
        config: Config,
        bus: SharedBus,
        host: Arc<dyn HostPlayer>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let address = resolve_server(&config, shutdown).await?;
        let endpoint = LmsEndpoint::new(address.host.clone(), address.port)
            .with_credentials(config.lms.username.clone(), config.lms.password.clone());
        let rpc = LmsRpc::new(endpoint, config.lms.rpc_timeout())?;

        let player_id = resolve_player(
            &rpc,
            config.lms.player_id.as_deref(),
            config.discovery.rescan_interval(),
            shutdown,
        )
        .await?;

        let server = Arc::new(ServerState::new(rpc, player_id, bus.clone(), &config.sync));
        let local = Arc::new(LocalPlayer::new(
            host,
            config.proxy.port,
            config.sync.seek_settle(),
            config.sync.playlist_window,
        ));
        let guard = SyncGuard::new(config.sync.busy_timeout());
        let reconciler = Arc::new(Reconciler::new(
            server.clone(),
            local.clone(),
            guard.clone(),
            bus.clone(),
            &config.sync,
        ));
        let coordinator = ComponentCoordinator::new(bus.clone(), shutdown.child_token());

        Ok(Self {
            config,
            address,
            bus,
            server,
            local,
            guard,
            reconciler,
            wake: Arc::new(Notify::new()),
            coordinator,
            fatal: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn player_id(&self) -> &str {
        self.server.player_id()
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Cancelled when the bridge cannot continue (e.g. rejected credentials)
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start the CLI listener, the reconciler and the host event mirror
    pub async fn start(&self, host_events: mpsc::Receiver<HostEvent>) -> Result<()> {
        let settings = CliSettings {
            host: self.address.host.clone(),
            port: self.address.cli_port,
            username: self.config.lms.username.clone(),
            password: self.config.lms.password.clone(),
            connect_timeout: self.config.lms.cli_connect_timeout(),
            read_timeout: self.config.lms.cli_read_timeout(),
            max_liveness_failures: self.config.lms.max_liveness_failures,
        };
        let listener = CliListener::new(
            settings,
            notification_handlers(self.server.player_id(), self.wake.clone()),
        );
        let fatal = self.fatal.clone();
        self.coordinator
            .start("lms-cli", move |bus, cancel| async move {
                let handle = AdapterHandle::new(listener, bus, cancel);
                if let Err(e) = handle.run_with_retry(RetryConfig::default()).await {
                    let rejected = e.downcast_ref::<LmsError>().is_some_and(LmsError::is_fatal);
                    if rejected {
                        error!("CLI listener stopped: {:#}", e);
                        fatal.cancel();
                    } else {
                        warn!("CLI listener stopped, continuing with polling only: {:#}", e);
                    }
                }
            })
            .await?;

        let reconciler = self.reconciler.clone();
        let wake = self.wake.clone();
        let fatal = self.fatal.clone();
        self.coordinator
            .start("sync", move |_bus, cancel| async move {
                if let Err(e) = reconciler.run(cancel, wake).await {
                    error!("Reconciler stopped: {:#}", e);
                    fatal.cancel();
                }
            })
            .await?;

        let mirror = Mirror::new(
            self.server.clone(),
            self.local.clone(),
            self.guard.clone(),
            self.bus.clone(),
            &self.config.sync,
        );
        self.coordinator
            .start("mirror", move |_bus, cancel| mirror.run(host_events, cancel))
            .await?;

        info!(
            "Bridge running: LMS {}:{} (cli {}), player {}",
            self.address.host,
            self.address.port,
            self.address.cli_port,
            self.server.player_id()
        );
        Ok(())
    }

    pub async fn status(&self) -> BridgeStatus {
        BridgeStatus {
            version: BRIDGE_VERSION,
            git_sha: BRIDGE_GIT_SHA,
            server: self.address.clone(),
            remote: self.server.view().await,
            local: self.local.snapshot().await,
            media: self.local.media(),
            auto_powered_off: self.reconciler.auto_powered_off(),
            busy: self.guard.is_busy(),
            components: self.coordinator.component_status().await,
        }
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
