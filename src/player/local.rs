//! Local Player Adapter
//!
//! Owns the local queue and transport bookkeeping on top of a [`HostPlayer`].
//! The queue mirrors a window of the remote playlist; each slot remembers the
//! remote index it stands for.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::lms::LmsError;
use crate::player::host::{HostEvent, HostMedia, HostPlayer};
use crate::player::track::TrackDescriptor;
use crate::sync::server_state::{DETAILED_TAGS, QUEUE_TAGS};
use crate::sync::status::PlaylistEntry;

/// How long a command's host callback counts as our own echo
const ECHO_WINDOW: Duration = Duration::from_secs(3);

/// Where queue entries come from
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn playlist_window(
        &self,
        start: usize,
        count: usize,
        tags: &str,
    ) -> Result<Vec<PlaylistEntry>, LmsError>;
}

#[derive(Debug, Default)]
pub struct LocalPlaybackState {
    pub is_playing: bool,
    pub is_paused: bool,
    pub playlist: Vec<TrackDescriptor>,
    /// Queue slot currently loaded
    pub current_slot: Option<usize>,
    /// Remote elapsed time, used when the host cannot report a position
    pub last_known_time: f64,
    /// Remote playlist checksum the queue was built from
    pub checksum: Option<String>,
    pending_echoes: VecDeque<(&'static str, Instant)>,
}

impl LocalPlaybackState {
    fn current(&self) -> Option<&TrackDescriptor> {
        self.current_slot.and_then(|slot| self.playlist.get(slot))
    }

    fn expect_echo(&mut self, kind: &'static str) {
        let now = Instant::now();
        self.pending_echoes
            .retain(|(_, at)| now.duration_since(*at) < ECHO_WINDOW);
        self.pending_echoes.push_back((kind, now));
    }

    fn take_echo(&mut self, kind: &str) -> bool {
        let now = Instant::now();
        self.pending_echoes
            .retain(|(_, at)| now.duration_since(*at) < ECHO_WINDOW);
        match self.pending_echoes.iter().position(|(k, _)| *k == kind) {
            Some(i) => {
                self.pending_echoes.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Point-in-time copy of the local state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalSnapshot {
    pub is_playing: bool,
    pub is_paused: bool,
    /// Remote index of the loaded slot
    pub queue_position: Option<usize>,
    pub queue_len: usize,
    /// Remote index range covered by the queue, end exclusive
    pub queue_span: Option<(usize, usize)>,
    pub checksum: Option<String>,
    pub current_title: Option<String>,
    pub current_is_radio: bool,
    pub current_url: Option<String>,
    pub last_known_time: f64,
}

/// Who caused a host event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Callback for a command this adapter issued
    Echo,
    /// Someone operated the host directly
    External { was_playing: bool },
}

pub struct LocalPlayer {
    host: Arc<dyn HostPlayer>,
    state: RwLock<LocalPlaybackState>,
    proxy_port: u16,
    seek_settle: Duration,
    window: usize,
}

impl LocalPlayer {
    pub fn new(host: Arc<dyn HostPlayer>, proxy_port: u16, seek_settle: Duration, window: usize) -> Self {
        Self {
            host,
            state: RwLock::new(LocalPlaybackState::default()),
            proxy_port,
            seek_settle,
            window: window.max(1),
        }
    }

    pub fn media(&self) -> HostMedia {
        self.host.media()
    }

    pub fn is_shuffled(&self) -> bool {
        self.host.is_shuffled()
    }

    pub async fn set_shuffle(&self, enabled: bool) -> Result<()> {
        self.host.set_shuffle(enabled).await
    }

    pub async fn snapshot(&self) -> LocalSnapshot {
        let state = self.state.read().await;
        let current = state.current();
        LocalSnapshot {
            is_playing: state.is_playing,
            is_paused: state.is_paused,
            queue_position: current.map(|t| t.playlist_index),
            queue_len: state.playlist.len(),
            queue_span: match (state.playlist.first(), state.playlist.last()) {
                (Some(first), Some(last)) => {
                    Some((first.playlist_index, last.playlist_index + 1))
                }
                _ => None,
            },
            checksum: state.checksum.clone(),
            current_title: current.map(|t| t.title.clone()).filter(|t| !t.is_empty()),
            current_is_radio: current.is_some_and(|t| t.is_radio),
            current_url: current.and_then(|t| t.remote_url.clone()),
            last_known_time: state.last_known_time,
        }
    }

    /// Remote index of the loaded slot
    pub async fn queue_position(&self) -> Option<usize> {
        self.state.read().await.current().map(|t| t.playlist_index)
    }

    /// Feed the remote elapsed time used as the position fallback
    pub async fn note_remote_time(&self, seconds: f64) {
        self.state.write().await.last_known_time = seconds;
    }

    /// Host position, or the last known remote time when the host cannot tell
    pub async fn current_time(&self) -> f64 {
        match self.host.time().await {
            Ok(t) => t,
            Err(e) => {
                let fallback = self.state.read().await.last_known_time;
                debug!("local: position unavailable ({}), using {:.1}", e, fallback);
                fallback
            }
        }
    }

    /// Replace the queue with `tracks` and start at slot `start`
    pub async fn play(&self, tracks: Vec<TrackDescriptor>, start: usize) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.expect_echo("started");
        }
        self.host.play_queue(tracks.clone(), start).await?;

        let mut state = self.state.write().await;
        state.playlist = tracks;
        state.current_slot = Some(start);
        state.is_playing = true;
        state.is_paused = false;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.state.write().await.expect_echo("paused");
        self.host.pause().await?;
        self.state.write().await.is_paused = true;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.state.write().await.expect_echo("resumed");
        self.host.resume().await?;
        self.state.write().await.is_paused = false;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.state.write().await.expect_echo("stopped");
        self.host.stop().await?;
        let mut state = self.state.write().await;
        state.is_playing = false;
        state.is_paused = false;
        state.current_slot = None;
        Ok(())
    }

    /// Seek and give the host time to settle before the next position read
    pub async fn seek(&self, seconds: f64) -> Result<()> {
        self.state.write().await.expect_echo("seeked");
        self.host.seek(seconds).await?;
        tokio::time::sleep(self.seek_settle).await;
        Ok(())
    }

    /// Jump to the slot holding remote index `index`. Returns false when the
    /// queue does not cover it.
    pub async fn play_index(&self, index: usize) -> Result<bool> {
        let slot = {
            let state = self.state.read().await;
            state.playlist.iter().position(|t| t.playlist_index == index)
        };
        let Some(slot) = slot else {
            return Ok(false);
        };

        self.state.write().await.expect_echo("started");
        self.host.play_index(slot).await?;

        let mut state = self.state.write().await;
        state.current_slot = Some(slot);
        state.is_playing = true;
        state.is_paused = false;
        Ok(true)
    }

    /// Rebuild the queue from the remote playlist, starting at `index`.
    ///
    /// The first entry is fetched with full detail and starts playing right
    /// away; the rest of the window is fetched and appended afterwards.
    pub async fn update_playlist(
        &self,
        source: &dyn PlaylistSource,
        index: usize,
        checksum: Option<String>,
    ) -> Result<()> {
        let first = source.playlist_window(index, 1, DETAILED_TAGS).await?;
        let Some(entry) = first.first() else {
            warn!("local: remote playlist has no entry {}", index);
            return Ok(());
        };
        let track = TrackDescriptor::from_entry(entry, index, self.proxy_port);
        info!("local: playing '{}' (remote index {})", track.title, index);

        self.play(vec![track], 0).await?;
        self.state.write().await.checksum = checksum;

        if self.window <= 1 {
            return Ok(());
        }

        let rest = match source
            .playlist_window(index + 1, self.window - 1, QUEUE_TAGS)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("local: could not fetch queue after {}: {}", index, e);
                return Ok(());
            }
        };
        let tracks: Vec<TrackDescriptor> = rest
            .iter()
            .enumerate()
            .map(|(i, entry)| TrackDescriptor::from_entry(entry, index + 1 + i, self.proxy_port))
            .collect();
        if tracks.is_empty() {
            return Ok(());
        }

        let count = tracks.len();
        if let Err(e) = self.host.append(tracks.clone()).await {
            warn!("local: appending {} tracks failed: {:#}", count, e);
            return Ok(());
        }
        self.state.write().await.playlist.extend(tracks);
        debug!("local: queued {} more tracks", count);
        Ok(())
    }

    /// Apply a host callback to the local state and report who caused it
    pub async fn on_host_event(&self, event: &HostEvent) -> EventOrigin {
        let mut state = self.state.write().await;
        let was_playing = state.is_playing;
        let echo = state.take_echo(event.kind());

        match event {
            HostEvent::Started { position } => {
                let len = state.playlist.len();
                state.current_slot = position.filter(|p| *p < len);
                state.is_playing = state.current_slot.is_some();
                state.is_paused = false;
            }
            HostEvent::Paused => state.is_paused = true,
            HostEvent::Resumed => state.is_paused = false,
            HostEvent::Stopped | HostEvent::Ended => {
                state.is_playing = false;
                state.is_paused = false;
                state.current_slot = None;
            }
            HostEvent::Seeked { .. } | HostEvent::SpeedChanged { .. } => {}
        }

        if echo {
            EventOrigin::Echo
        } else {
            EventOrigin::External { was_playing }
        }
    }
}
