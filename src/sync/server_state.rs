//! Server State Model
//!
//! Holds the last good `ServerStatus` of the bridged player and tracks the
//! command this bridge issued most recently, so the reconciliation loop does
//! not react to its own pending changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapters::lms::{LmsError, LmsRpc};
use crate::bus::{BusEvent, SharedBus};
use crate::config::SyncConfig;
use crate::player::PlaylistSource;
use crate::sync::status::{PlayerMode, PlaylistEntry, ServerStatus};

/// Tags for the per-tick status query
pub const STATUS_TAGS: &str = "tags:adlKNuxJc";
/// Tags for the entry that starts playing immediately
pub const DETAILED_TAGS: &str = "acdjKlxJNu";
/// Tags for the rest of the queue window
pub const QUEUE_TAGS: &str = "adluN";

/// What a refresh must observe before a pending command counts as confirmed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expectation {
    Mode(PlayerMode),
    Power(bool),
    /// Any successful refresh after the command completed
    Refresh,
}

impl Expectation {
    fn is_met_by(&self, status: &ServerStatus) -> bool {
        match self {
            Self::Mode(mode) => status.mode == *mode,
            Self::Power(on) => status.power == *on,
            Self::Refresh => true,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCommand {
    label: String,
    issued_at: Instant,
    acknowledged_at: Option<Instant>,
    expect: Expectation,
}

#[derive(Debug, Default)]
struct Inner {
    status: Option<ServerStatus>,
    stale: bool,
    consecutive_failures: u32,
    pending: Option<PendingCommand>,
    last_refresh: Option<DateTime<Utc>>,
}

/// Serializable view for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServerStateView {
    pub player_id: String,
    pub status: Option<ServerStatus>,
    pub stale: bool,
    pub changing: bool,
    pub consecutive_failures: u32,
    pub pending_command: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
}

pub struct ServerState {
    rpc: LmsRpc,
    player_id: String,
    bus: SharedBus,
    inner: RwLock<Inner>,
    changing_timeout: Duration,
    max_failures: u32,
}

impl ServerState {
    pub fn new(rpc: LmsRpc, player_id: impl Into<String>, bus: SharedBus, config: &SyncConfig) -> Self {
        Self {
            rpc,
            player_id: player_id.into(),
            bus,
            inner: RwLock::new(Inner::default()),
            changing_timeout: config.changing_timeout(),
            max_failures: config.max_poll_failures.max(1),
        }
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Query the player and replace the snapshot.
    ///
    /// Timeouts and refused connections come back as `TransientUnavailable`;
    /// the previous snapshot stays in place and is flagged stale.
    pub async fn refresh(&self) -> Result<ServerStatus, LmsError> {
        let started = Instant::now();
        let result = self
            .rpc
            .send_command(
                &self.player_id,
                vec![json!("status"), json!("-"), json!(1), json!(STATUS_TAGS)],
            )
            .await
            .and_then(|value| ServerStatus::from_result(&value));

        match result {
            Ok(status) => {
                let events = self.commit(status.clone(), started).await;
                for event in events {
                    self.bus.publish(event);
                }
                Ok(status)
            }
            Err(err) => {
                let err = match err {
                    LmsError::Connection { endpoint, message } => LmsError::TransientUnavailable(
                        format!("{}: {}", endpoint, message),
                    ),
                    other => other,
                };
                if let Some(event) = self.record_failure(&err).await {
                    self.bus.publish(event);
                }
                Err(err)
            }
        }
    }

    async fn commit(&self, status: ServerStatus, started: Instant) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let mut inner = self.inner.write().await;

        let recovered = inner.status.is_none() || inner.consecutive_failures >= self.max_failures;
        if recovered {
            info!(
                "lms: {} reachable, player {} is {}",
                self.rpc.host(),
                self.player_id,
                status.mode
            );
            events.push(BusEvent::LmsConnected {
                host: self.rpc.host().to_string(),
                port: self.rpc.port(),
            });
        }

        let previous = inner.status.as_ref();
        if previous.map(|s| s.mode) != Some(status.mode) {
            events.push(BusEvent::RemoteModeChanged {
                player_id: self.player_id.clone(),
                mode: status.mode.to_string(),
            });
        }
        if previous.is_some_and(|s| s.checksum != status.checksum) {
            events.push(BusEvent::RemotePlaylistChanged {
                player_id: self.player_id.clone(),
                checksum: status.checksum.clone(),
            });
        }

        if let Some(pending) = &inner.pending {
            // Only a poll that started after the command completed can confirm it
            let confirmed = pending
                .acknowledged_at
                .is_some_and(|ack| ack <= started && pending.expect.is_met_by(&status));
            if confirmed {
                debug!("lms: '{}' confirmed", pending.label);
                inner.pending = None;
            } else if pending.issued_at.elapsed() >= self.changing_timeout {
                warn!(
                    "lms: '{}' not confirmed after {:?}, clearing",
                    pending.label, self.changing_timeout
                );
                inner.pending = None;
            }
        }

        inner.status = Some(status);
        inner.stale = false;
        inner.consecutive_failures = 0;
        inner.last_refresh = Some(Utc::now());
        events
    }

    async fn record_failure(&self, err: &LmsError) -> Option<BusEvent> {
        let mut inner = self.inner.write().await;
        inner.stale = true;
        inner.consecutive_failures += 1;
        let failures = inner.consecutive_failures;

        if failures == self.max_failures {
            error!(
                "lms: {} failed {} polls in a row: {}",
                self.rpc.host(),
                failures,
                err
            );
            Some(BusEvent::LmsUnavailable {
                host: self.rpc.host().to_string(),
                consecutive_failures: failures,
                error: err.to_string(),
            })
        } else {
            warn!("lms: poll failed ({}): {}", failures, err);
            None
        }
    }

    /// Send a player command and mark the model as changing until a later
    /// refresh observes `expect`.
    pub async fn send_command(&self, tokens: Vec<Value>, expect: Expectation) -> Result<Value, LmsError> {
        let label = tokens
            .iter()
            .map(|t| t.as_str().map(str::to_string).unwrap_or_else(|| t.to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        let issued_at = Instant::now();

        {
            let mut inner = self.inner.write().await;
            inner.pending = Some(PendingCommand {
                label: label.clone(),
                issued_at,
                acknowledged_at: None,
                expect,
            });
        }

        let result = self.rpc.send_command(&self.player_id, tokens).await;

        let mut inner = self.inner.write().await;
        let ours = inner
            .pending
            .as_ref()
            .is_some_and(|p| p.issued_at == issued_at);
        match &result {
            Ok(_) if ours => {
                if let Some(pending) = inner.pending.as_mut() {
                    pending.acknowledged_at = Some(Instant::now());
                }
                info!("lms: sent '{}'", label);
            }
            Ok(_) => info!("lms: sent '{}'", label),
            Err(e) => {
                if ours {
                    inner.pending = None;
                }
                warn!("lms: '{}' failed: {}", label, e);
            }
        }
        result
    }

    /// True while a command issued here is unconfirmed and not yet expired
    pub async fn is_changing(&self) -> bool {
        let inner = self.inner.read().await;
        inner
            .pending
            .as_ref()
            .is_some_and(|p| p.issued_at.elapsed() < self.changing_timeout)
    }

    pub async fn snapshot(&self) -> Option<ServerStatus> {
        self.inner.read().await.status.clone()
    }

    pub async fn mode(&self) -> Option<PlayerMode> {
        self.inner.read().await.status.as_ref().map(|s| s.mode)
    }

    /// Remote elapsed seconds from the last good snapshot
    pub async fn elapsed(&self) -> Option<f64> {
        self.inner
            .read()
            .await
            .status
            .as_ref()
            .map(|s| s.elapsed_seconds)
    }

    pub async fn is_stale(&self) -> bool {
        self.inner.read().await.stale
    }

    pub async fn view(&self) -> ServerStateView {
        let inner = self.inner.read().await;
        ServerStateView {
            player_id: self.player_id.clone(),
            status: inner.status.clone(),
            stale: inner.stale,
            changing: inner
                .pending
                .as_ref()
                .is_some_and(|p| p.issued_at.elapsed() < self.changing_timeout),
            consecutive_failures: inner.consecutive_failures,
            pending_command: inner.pending.as_ref().map(|p| p.label.clone()),
            last_refresh: inner.last_refresh,
        }
    }

    /// Fetch `count` playlist entries starting at `start`
    pub async fn current_playlist(
        &self,
        start: usize,
        count: usize,
        tags: &str,
    ) -> Result<Vec<PlaylistEntry>, LmsError> {
        let result = self
            .rpc
            .send_command(
                &self.player_id,
                vec![
                    json!("status"),
                    json!(start),
                    json!(count),
                    json!(format!("tags:{}", tags)),
                ],
            )
            .await?;

        let Some(items) = result.get("playlist_loop").and_then(|v| v.as_array()) else {
            return Ok(Vec::new());
        };

        Ok(items
            .iter()
            .filter_map(|item| match serde_json::from_value::<PlaylistEntry>(item.clone()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("lms: skipping playlist entry: {}", e);
                    None
                }
            })
            .collect())
    }

    pub async fn pause(&self) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("pause"), json!(1)],
            Expectation::Mode(PlayerMode::Pause),
        )
        .await
        .map(drop)
    }

    pub async fn unpause(&self) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("pause"), json!(0)],
            Expectation::Mode(PlayerMode::Play),
        )
        .await
        .map(drop)
    }

    pub async fn stop(&self) -> Result<(), LmsError> {
        self.send_command(vec![json!("stop")], Expectation::Mode(PlayerMode::Stop))
            .await
            .map(drop)
    }

    pub async fn next_track(&self) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("playlist"), json!("index"), json!("+1")],
            Expectation::Refresh,
        )
        .await
        .map(drop)
    }

    /// Absolute seek on the remote player
    pub async fn seek_to(&self, seconds: f64) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("time"), json!(format!("{:.1}", seconds.max(0.0)))],
            Expectation::Refresh,
        )
        .await
        .map(drop)
    }

    /// Relative skip, `time +N` / `time -N`
    pub async fn skip(&self, seconds: i32) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("time"), json!(format!("{:+}", seconds))],
            Expectation::Refresh,
        )
        .await
        .map(drop)
    }

    pub async fn set_power(&self, on: bool) -> Result<(), LmsError> {
        self.send_command(
            vec![json!("power"), json!(if on { 1 } else { 0 })],
            Expectation::Power(on),
        )
        .await
        .map(drop)
    }
}

#[async_trait]
impl PlaylistSource for ServerState {
    async fn playlist_window(
        &self,
        start: usize,
        count: usize,
        tags: &str,
    ) -> Result<Vec<PlaylistEntry>, LmsError> {
        self.current_playlist(start, count, tags).await
    }
}

pub type SharedServerState = Arc<ServerState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lms::LmsEndpoint;
    use crate::bus::EventBus;

    fn unreachable_state(max_poll_failures: u32) -> (ServerState, SharedBus) {
        // Port 1 on loopback refuses immediately
        let rpc = LmsRpc::new(LmsEndpoint::new("127.0.0.1", 1), Duration::from_secs(2)).unwrap();
        let bus = Arc::new(EventBus::new(16));
        let config = SyncConfig {
            max_poll_failures,
            ..SyncConfig::default()
        };
        (
            ServerState::new(rpc, "aa:bb:cc:dd:ee:ff", bus.clone(), &config),
            bus,
        )
    }

    fn status(mode: PlayerMode, power: bool) -> ServerStatus {
        ServerStatus {
            mode,
            power,
            playlist_position: 0,
            playlist_track_count: 1,
            elapsed_seconds: 0.0,
            duration_seconds: None,
            current_title: None,
            checksum: Some("1".to_string()),
            shuffle: false,
            track_url: None,
            track_title: None,
        }
    }

    #[test]
    fn test_expectations() {
        let playing = status(PlayerMode::Play, true);
        assert!(Expectation::Mode(PlayerMode::Play).is_met_by(&playing));
        assert!(!Expectation::Mode(PlayerMode::Pause).is_met_by(&playing));
        assert!(Expectation::Power(true).is_met_by(&playing));
        assert!(!Expectation::Power(false).is_met_by(&playing));
        assert!(Expectation::Refresh.is_met_by(&playing));
    }

    #[tokio::test]
    async fn test_refused_refresh_is_transient_and_marks_stale() {
        let (state, _bus) = unreachable_state(3);

        let err = state.refresh().await.unwrap_err();
        assert!(matches!(err, LmsError::TransientUnavailable(_)), "{:?}", err);
        assert!(state.is_stale().await);
        assert!(state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_event_after_consecutive_failures() {
        let (state, bus) = unreachable_state(2);
        let mut rx = bus.subscribe();

        let _ = state.refresh().await;
        assert!(rx.try_recv().is_err());

        let _ = state.refresh().await;
        match rx.try_recv().unwrap() {
            BusEvent::LmsUnavailable {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(state.view().await.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_failed_command_clears_changing() {
        let (state, _bus) = unreachable_state(3);
        assert!(!state.is_changing().await);

        assert!(state.pause().await.is_err());
        assert!(!state.is_changing().await);
        assert!(state.view().await.pending_command.is_none());
    }
}
