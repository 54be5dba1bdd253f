//! Reconciliation loop
//!
//! Every tick compares the remote snapshot with the local player and applies
//! at most one corrective action. Rules are evaluated in priority order:
//! output conflicts (video on the host) first, then playlist identity, then
//! transport state, then position.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::lms::LmsError;
use crate::bus::{BusEvent, SharedBus};
use crate::config::SyncConfig;
use crate::player::{HostMedia, LocalPlayer, LocalSnapshot};
use crate::sync::guard::SyncGuard;
use crate::sync::server_state::SharedServerState;
use crate::sync::status::{PlayerMode, ServerStatus};

/// One corrective step
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Host started video while the remote player renders audio
    PowerOffRemote,
    /// Video ended after an automatic power-off
    PowerOnRemote,
    RebuildQueue { index: usize },
    StartPlayback { index: usize, rebuild: bool },
    StopLocal,
    /// Host shuffles but the remote does not: unshuffle and replay
    DisableShuffle { index: usize },
    PauseLocal,
    ResumeLocal,
    JumpTo { index: usize },
    SeekLocal { seconds: f64 },
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOffRemote => write!(f, "power off remote"),
            Self::PowerOnRemote => write!(f, "power on remote"),
            Self::RebuildQueue { index } => write!(f, "rebuild queue at {}", index),
            Self::StartPlayback { index, rebuild } => {
                write!(f, "start playback at {}", index)?;
                if *rebuild {
                    write!(f, " (rebuild)")?;
                }
                Ok(())
            }
            Self::StopLocal => write!(f, "stop local"),
            Self::DisableShuffle { index } => write!(f, "disable shuffle, replay {}", index),
            Self::PauseLocal => write!(f, "pause local"),
            Self::ResumeLocal => write!(f, "resume local"),
            Self::JumpTo { index } => write!(f, "jump to {}", index),
            Self::SeekLocal { seconds } => write!(f, "seek local to {:.1}s", seconds),
        }
    }
}

/// Everything one decision looks at
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub remote: &'a ServerStatus,
    pub local: &'a LocalSnapshot,
    pub media: HostMedia,
    pub host_shuffled: bool,
    /// Host playback position in seconds
    pub local_time: f64,
    pub auto_powered_off: bool,
    pub seek_tolerance: f64,
}

/// Pick the single action for this tick, or `None` when in sync
pub fn decide(obs: &Observation<'_>) -> Option<SyncAction> {
    let remote = obs.remote;
    let local = obs.local;
    let video = obs.media == HostMedia::Video;

    if video && remote.power && !obs.auto_powered_off {
        return Some(SyncAction::PowerOffRemote);
    }
    if obs.auto_powered_off && !video {
        return Some(SyncAction::PowerOnRemote);
    }
    if video {
        return None;
    }

    let index = remote.playlist_position;
    let has_tracks = remote.playlist_track_count > 0;

    if local.is_playing && has_tracks && local.checksum != remote.checksum {
        return Some(SyncAction::RebuildQueue { index });
    }

    if !local.is_playing {
        if remote.mode == PlayerMode::Play && has_tracks {
            let covered = local
                .queue_span
                .is_some_and(|(start, end)| (start..end).contains(&index));
            let rebuild = local.checksum != remote.checksum || !covered;
            return Some(SyncAction::StartPlayback { index, rebuild });
        }
        return None;
    }

    if remote.mode == PlayerMode::Stop {
        return Some(SyncAction::StopLocal);
    }
    if obs.host_shuffled && !remote.shuffle {
        return Some(SyncAction::DisableShuffle { index });
    }
    if remote.mode == PlayerMode::Pause && !local.is_paused {
        return Some(SyncAction::PauseLocal);
    }
    if remote.mode == PlayerMode::Play && local.is_paused {
        return Some(SyncAction::ResumeLocal);
    }
    if local.queue_position != Some(index) {
        return Some(SyncAction::JumpTo { index });
    }

    let live = remote.is_live_stream() || local.current_is_radio;
    if !live && remote.track_title.is_some() && local.current_title != remote.track_title {
        return Some(SyncAction::RebuildQueue { index });
    }

    if remote.mode == PlayerMode::Play
        && !local.is_paused
        && !live
        && (obs.local_time - remote.elapsed_seconds).abs() > obs.seek_tolerance
    {
        return Some(SyncAction::SeekLocal {
            seconds: remote.elapsed_seconds,
        });
    }

    None
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Poll failed; the previous snapshot stays, flagged stale
    Unavailable,
    /// Poll answered with something unusable
    Skipped,
    /// Server refused our credentials
    Rejected(String),
    Busy,
    Changing,
    InSync,
    Applied(SyncAction),
    Failed(SyncAction),
}

pub struct Reconciler {
    server: SharedServerState,
    local: Arc<LocalPlayer>,
    guard: Arc<SyncGuard>,
    bus: SharedBus,
    tick_period: Duration,
    seek_tolerance: f64,
    auto_powered_off: AtomicBool,
}

impl Reconciler {
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
            tick_period: config.tick(),
            seek_tolerance: config.seek_tolerance_secs,
            auto_powered_off: AtomicBool::new(false),
        }
    }

    /// True while the remote is off because the host took over the output
    pub fn auto_powered_off(&self) -> bool {
        self.auto_powered_off.load(Ordering::SeqCst)
    }

    /// Poll once and apply at most one action
    pub async fn tick(&self) -> TickOutcome {
        let remote = match self.server.refresh().await {
            Ok(status) => status,
            Err(LmsError::Authentication(msg)) => return TickOutcome::Rejected(msg),
            Err(LmsError::Protocol(msg)) => {
                warn!("sync: skipping tick: {}", msg);
                return TickOutcome::Skipped;
            }
            Err(e) => {
                debug!("sync: skipping tick: {}", e);
                return TickOutcome::Unavailable;
            }
        };

        self.guard.expire_stale();
        if self.guard.is_busy() {
            return TickOutcome::Busy;
        }
        if self.server.is_changing().await {
            debug!("sync: remote change pending");
            return TickOutcome::Changing;
        }
        let Some(_token) = self.guard.try_acquire() else {
            return TickOutcome::Busy;
        };

        self.local.note_remote_time(remote.elapsed_seconds).await;
        let local = self.local.snapshot().await;
        let local_time = if local.is_playing {
            self.local.current_time().await
        } else {
            remote.elapsed_seconds
        };

        let observation = Observation {
            remote: &remote,
            local: &local,
            media: self.local.media(),
            host_shuffled: self.local.is_shuffled(),
            local_time,
            auto_powered_off: self.auto_powered_off(),
            seek_tolerance: self.seek_tolerance,
        };

        let Some(action) = decide(&observation) else {
            return TickOutcome::InSync;
        };

        info!("sync: {}", action);
        match self.apply(&action, &remote).await {
            Ok(()) => {
                self.bus.publish(BusEvent::SyncActionApplied {
                    action: action.to_string(),
                });
                TickOutcome::Applied(action)
            }
            Err(e) => {
                warn!("sync: '{}' failed: {:#}", action, e);
                self.bus.publish(BusEvent::SyncActionFailed {
                    action: action.to_string(),
                    error: format!("{:#}", e),
                });
                TickOutcome::Failed(action)
            }
        }
    }

    async fn apply(&self, action: &SyncAction, remote: &ServerStatus) -> Result<()> {
        let server = self.server.as_ref();
        match action {
            SyncAction::PowerOffRemote => {
                server.set_power(false).await?;
                self.auto_powered_off.store(true, Ordering::SeqCst);
            }
            SyncAction::PowerOnRemote => {
                server.set_power(true).await?;
                self.auto_powered_off.store(false, Ordering::SeqCst);
            }
            SyncAction::RebuildQueue { index } => {
                self.local
                    .update_playlist(server, *index, remote.checksum.clone())
                    .await?;
            }
            SyncAction::StartPlayback { index, rebuild } => {
                if *rebuild || !self.local.play_index(*index).await? {
                    self.local
                        .update_playlist(server, *index, remote.checksum.clone())
                        .await?;
                }
            }
            SyncAction::StopLocal => self.local.stop().await?,
            SyncAction::DisableShuffle { index } => {
                self.local.set_shuffle(false).await?;
                self.local
                    .update_playlist(server, *index, remote.checksum.clone())
                    .await?;
            }
            SyncAction::PauseLocal => self.local.pause().await?,
            SyncAction::ResumeLocal => self.local.resume().await?,
            SyncAction::JumpTo { index } => {
                if !self.local.play_index(*index).await? {
                    self.local
                        .update_playlist(server, *index, remote.checksum.clone())
                        .await?;
                }
            }
            SyncAction::SeekLocal { seconds } => self.local.seek(*seconds).await?,
        }
        Ok(())
    }

    /// Tick until shutdown. `wake` forces an early tick (CLI notifications).
    ///
    /// Only a credential rejection ends the loop with an error.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, wake: Arc<Notify>) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("sync: reconciling every {:?}", self.tick_period);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = interval.tick() => {}
                _ = wake.notified() => debug!("sync: woken early"),
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                outcome = self.tick() => outcome,
            };

            if let TickOutcome::Rejected(msg) = outcome {
                error!("sync: LMS rejected credentials, stopping: {}", msg);
                break Err(anyhow!("LMS rejected credentials: {}", msg));
            }
        };

        self.bus.publish(BusEvent::ComponentStopped {
            component: "sync".to_string(),
        });
        info!("sync: stopped");
        result
    }
}
