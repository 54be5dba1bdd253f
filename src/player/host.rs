//! Boundary to the host media player (the media center side).

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::player::track::TrackDescriptor;

/// What the host is currently rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMedia {
    Idle,
    Audio,
    Video,
}

/// Callbacks from the host player
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// A new item started; `position` is its queue slot, `None` for foreign media
    Started { position: Option<usize> },
    Paused,
    Resumed,
    Stopped,
    /// Reached the end of the queue
    Ended,
    Seeked { seconds: f64 },
    /// Playback speed changed (fast-forward > 1, rewind < 0)
    SpeedChanged { speed: i32 },
}

impl HostEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Stopped => "stopped",
            Self::Ended => "ended",
            Self::Seeked { .. } => "seeked",
            Self::SpeedChanged { .. } => "speed_changed",
        }
    }
}

/// Transport and queue control of the host player
#[async_trait]
pub trait HostPlayer: Send + Sync {
    /// Replace the queue and start playing at `start`
    async fn play_queue(&self, tracks: Vec<TrackDescriptor>, start: usize) -> Result<()>;
    async fn append(&self, tracks: Vec<TrackDescriptor>) -> Result<()>;
    /// Jump to a queue slot
    async fn play_index(&self, index: usize) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn seek(&self, seconds: f64) -> Result<()>;
    /// Current playback position; fails when nothing is loaded
    async fn time(&self) -> Result<f64>;
    fn media(&self) -> HostMedia;
    fn is_shuffled(&self) -> bool;
    async fn set_shuffle(&self, enabled: bool) -> Result<()>;
}
