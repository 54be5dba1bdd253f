//! Host event mirror
//!
//! Pushes what a user does on the host (pause, resume, stop, skip, seek,
//! fast-forward) to the remote player. Callbacks for commands the bridge
//! issued itself are recognised as echoes and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::lms::LmsError;
use crate::bus::{BusEvent, SharedBus};
use crate::config::SyncConfig;
use crate::player::{EventOrigin, HostEvent, HostMedia, LocalPlayer};
use crate::sync::guard::SyncGuard;
use crate::sync::server_state::SharedServerState;
use crate::sync::status::PlayerMode;

/// Relative skip for host fast-forward / rewind
const SKIP_SECONDS: i32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOutcome {
    /// Callback for our own command
    Echo,
    /// Reconciler busy or a remote change is pending
    Suppressed,
    /// Nothing to mirror
    Ignored,
    Sent(String),
    Failed(String),
}

pub struct Mirror {
    server: SharedServerState,
    local: Arc<LocalPlayer>,
    guard: Arc<SyncGuard>,
    bus: SharedBus,
    seek_tolerance: f64,
    seek_settle: Duration,
}

impl Mirror {
    pub fn new(
        server: SharedServerState,
        local: Arc<LocalPlayer>,
        guard: Arc<SyncGuard>,
        bus: SharedBus,
        config: &SyncConfig,
    ) -> Self {
        Self {
            server,
            local,
            guard,
            bus,
            seek_tolerance: config.seek_tolerance_secs,
            seek_settle: config.seek_settle(),
        }
    }

    pub async fn handle(&self, event: &HostEvent) -> MirrorOutcome {
        // Held until the remote command is sent, so the reconciler never
        // observes the local change without the matching pending command
        let token = self.guard.try_acquire();

        let was_playing = match self.local.on_host_event(event).await {
            EventOrigin::Echo => return MirrorOutcome::Echo,
            EventOrigin::External { was_playing } => was_playing,
        };
        if token.is_none() || self.server.is_changing().await {
            debug!("mirror: suppressed {}", event.kind());
            return MirrorOutcome::Suppressed;
        }
        let Some(mode) = self.server.mode().await else {
            return MirrorOutcome::Ignored;
        };
        let server = self.server.as_ref();

        let (label, result): (&str, Result<(), LmsError>) = match event {
            HostEvent::Paused if self.local.media() == HostMedia::Audio && mode == PlayerMode::Play => {
                ("pause", server.pause().await)
            }
            HostEvent::Resumed if mode == PlayerMode::Pause => ("unpause", server.unpause().await),
            HostEvent::Stopped if self.local.media() != HostMedia::Video && mode != PlayerMode::Stop => {
                ("stop", server.stop().await)
            }
            HostEvent::Started { .. } if was_playing => {
                let current = self.local.snapshot().await.current_url;
                let remote_url = server.snapshot().await.and_then(|s| s.track_url);
                if current.is_none() || current == remote_url {
                    return MirrorOutcome::Ignored;
                }
                ("next track", server.next_track().await)
            }
            HostEvent::Seeked { seconds } => {
                let live = server
                    .snapshot()
                    .await
                    .is_some_and(|s| s.is_live_stream());
                let elapsed = server.elapsed().await.unwrap_or_default();
                if live || (seconds - elapsed).abs() <= self.seek_tolerance {
                    return MirrorOutcome::Ignored;
                }
                let result = server.seek_to(*seconds).await;
                tokio::time::sleep(self.seek_settle).await;
                ("seek", result)
            }
            HostEvent::SpeedChanged { speed } if mode == PlayerMode::Play && *speed > 1 => {
                ("skip forward", server.skip(SKIP_SECONDS).await)
            }
            HostEvent::SpeedChanged { speed } if mode == PlayerMode::Play && *speed < 0 => {
                ("skip back", server.skip(-SKIP_SECONDS).await)
            }
            _ => return MirrorOutcome::Ignored,
        };

        let action = format!("remote {}", label);
        match result {
            Ok(()) => {
                info!("mirror: {}", action);
                self.bus.publish(BusEvent::SyncActionApplied {
                    action: action.clone(),
                });
                MirrorOutcome::Sent(action)
            }
            Err(e) => {
                warn!("mirror: {} failed: {}", action, e);
                self.bus.publish(BusEvent::SyncActionFailed {
                    action: action.clone(),
                    error: e.to_string(),
                });
                MirrorOutcome::Failed(action)
            }
        }
    }

    /// Consume host events until shutdown or until the host goes away
    pub async fn run(self, mut events: mpsc::Receiver<HostEvent>, shutdown: CancellationToken) {
        info!("mirror: listening for host events");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("mirror: host event channel closed");
                        break;
                    };
                    let outcome = self.handle(&event).await;
                    debug!("mirror: {} -> {:?}", event.kind(), outcome);
                }
            }
        }

        self.bus.publish(BusEvent::ComponentStopped {
            component: "mirror".to_string(),
        });
        info!("mirror: stopped");
    }
}
