//! In-process host player.
//!
//! Keeps queue and transport state in memory and reports the same events a
//! media center would, so the bridge runs without one attached. The `user_*`
//! and `*_video` methods simulate someone operating the host directly.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::player::host::{HostEvent, HostMedia, HostPlayer};
use crate::player::track::TrackDescriptor;

/// Transport calls received through [`HostPlayer`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostAction {
    PlayQueue { len: usize, start: usize },
    Append { len: usize },
    PlayIndex { index: usize },
    Pause,
    Resume,
    Stop,
    Seek { seconds: f64 },
    SetShuffle { enabled: bool },
}

#[derive(Debug)]
struct HeadlessState {
    queue: Vec<TrackDescriptor>,
    position: Option<usize>,
    media: HostMedia,
    paused: bool,
    shuffled: bool,
    /// Position at the last transport change
    offset: f64,
    /// Set while the clock runs
    running_since: Option<Instant>,
    actions: Vec<HostAction>,
}

impl HeadlessState {
    fn clock(&self) -> f64 {
        self.offset
            + self
                .running_since
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0)
    }

    fn restart_clock(&mut self, offset: f64) {
        self.offset = offset;
        self.running_since = (!self.paused).then(Instant::now);
    }

    fn halt(&mut self) {
        self.media = HostMedia::Idle;
        self.position = None;
        self.paused = false;
        self.offset = 0.0;
        self.running_since = None;
    }
}

pub struct HeadlessHost {
    state: Mutex<HeadlessState>,
    events: mpsc::Sender<HostEvent>,
}

impl HeadlessHost {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            state: Mutex::new(HeadlessState {
                queue: Vec::new(),
                position: None,
                media: HostMedia::Idle,
                paused: false,
                shuffled: false,
                offset: 0.0,
                running_since: None,
                actions: Vec::new(),
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: HostEvent) {
        debug!("headless: {:?}", event);
        if let Err(e) = self.events.try_send(event) {
            warn!("headless: dropping host event: {}", e);
        }
    }

    /// Transport calls made by the bridge, oldest first
    pub fn actions(&self) -> Vec<HostAction> {
        self.state().actions.clone()
    }

    pub fn take_actions(&self) -> Vec<HostAction> {
        std::mem::take(&mut self.state().actions)
    }

    pub fn queue(&self) -> Vec<TrackDescriptor> {
        self.state().queue.clone()
    }

    pub fn position(&self) -> Option<usize> {
        self.state().position
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Video takes over the output; queued audio stops first
    pub fn start_video(&self) {
        let was_audio = {
            let mut state = self.state();
            let was_audio = state.media == HostMedia::Audio;
            state.halt();
            state.media = HostMedia::Video;
            state.running_since = Some(Instant::now());
            was_audio
        };
        if was_audio {
            self.emit(HostEvent::Stopped);
        }
        self.emit(HostEvent::Started { position: None });
    }

    pub fn end_video(&self) {
        let was_video = {
            let mut state = self.state();
            let was_video = state.media == HostMedia::Video;
            if was_video {
                state.halt();
            }
            was_video
        };
        if was_video {
            self.emit(HostEvent::Ended);
        }
    }

    pub fn user_pause(&self) {
        let changed = {
            let mut state = self.state();
            if state.media != HostMedia::Idle && !state.paused {
                let now = state.clock();
                state.paused = true;
                state.restart_clock(now);
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(HostEvent::Paused);
        }
    }

    pub fn user_resume(&self) {
        let changed = {
            let mut state = self.state();
            if state.media != HostMedia::Idle && state.paused {
                let now = state.clock();
                state.paused = false;
                state.restart_clock(now);
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(HostEvent::Resumed);
        }
    }

    pub fn user_seek(&self, seconds: f64) {
        let changed = {
            let mut state = self.state();
            if state.media != HostMedia::Idle {
                state.restart_clock(seconds.max(0.0));
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(HostEvent::Seeked { seconds });
        }
    }

    pub fn user_stop(&self) {
        let changed = {
            let mut state = self.state();
            let changed = state.media != HostMedia::Idle;
            state.halt();
            changed
        };
        if changed {
            self.emit(HostEvent::Stopped);
        }
    }

    /// Advance to the next queue slot, or end the queue
    pub fn user_next(&self) {
        let next = {
            let mut state = self.state();
            if state.media != HostMedia::Audio {
                return;
            }
            match state.position.map(|p| p + 1) {
                Some(next) if next < state.queue.len() => {
                    state.position = Some(next);
                    state.paused = false;
                    state.restart_clock(0.0);
                    Some(next)
                }
                _ => {
                    state.halt();
                    None
                }
            }
        };
        match next {
            Some(position) => self.emit(HostEvent::Started {
                position: Some(position),
            }),
            None => self.emit(HostEvent::Ended),
        }
    }

    pub fn user_speed(&self, speed: i32) {
        if self.state().media != HostMedia::Idle {
            self.emit(HostEvent::SpeedChanged { speed });
        }
    }
}

#[async_trait]
impl HostPlayer for HeadlessHost {
    async fn play_queue(&self, tracks: Vec<TrackDescriptor>, start: usize) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::PlayQueue {
                len: tracks.len(),
                start,
            });
            if start >= tracks.len() {
                return Err(anyhow!(
                    "start {} outside queue of {}",
                    start,
                    tracks.len()
                ));
            }
            state.queue = tracks;
            state.position = Some(start);
            state.media = HostMedia::Audio;
            state.paused = false;
            state.restart_clock(0.0);
        }
        self.emit(HostEvent::Started {
            position: Some(start),
        });
        Ok(())
    }

    async fn append(&self, tracks: Vec<TrackDescriptor>) -> Result<()> {
        let mut state = self.state();
        state.actions.push(HostAction::Append { len: tracks.len() });
        state.queue.extend(tracks);
        Ok(())
    }

    async fn play_index(&self, index: usize) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::PlayIndex { index });
            if index >= state.queue.len() {
                return Err(anyhow!("no queue slot {}", index));
            }
            state.position = Some(index);
            state.media = HostMedia::Audio;
            state.paused = false;
            state.restart_clock(0.0);
        }
        self.emit(HostEvent::Started {
            position: Some(index),
        });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::Pause);
            if state.media == HostMedia::Idle {
                return Err(anyhow!("nothing to pause"));
            }
            let now = state.clock();
            state.paused = true;
            state.restart_clock(now);
        }
        self.emit(HostEvent::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::Resume);
            if state.media == HostMedia::Idle {
                return Err(anyhow!("nothing to resume"));
            }
            let now = state.clock();
            state.paused = false;
            state.restart_clock(now);
        }
        self.emit(HostEvent::Resumed);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::Stop);
            state.halt();
        }
        self.emit(HostEvent::Stopped);
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<()> {
        {
            let mut state = self.state();
            state.actions.push(HostAction::Seek { seconds });
            if state.media == HostMedia::Idle {
                return Err(anyhow!("nothing to seek"));
            }
            state.restart_clock(seconds.max(0.0));
        }
        self.emit(HostEvent::Seeked { seconds });
        Ok(())
    }

    async fn time(&self) -> Result<f64> {
        let state = self.state();
        if state.media == HostMedia::Idle {
            return Err(anyhow!("nothing playing"));
        }
        Ok(state.clock())
    }

    fn media(&self) -> HostMedia {
        self.state().media
    }

    fn is_shuffled(&self) -> bool {
        self.state().shuffled
    }

    async fn set_shuffle(&self, enabled: bool) -> Result<()> {
        let mut state = self.state();
        state.actions.push(HostAction::SetShuffle { enabled });
        state.shuffled = enabled;
        Ok(())
    }
}
