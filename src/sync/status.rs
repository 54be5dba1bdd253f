//! Remote player status snapshot as reported by `status - 1 tags:...`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::lms::LmsError;

/// Remote transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerMode {
    Play,
    Pause,
    Stop,
}

impl PlayerMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for PlayerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number or numeric string (LMS mixes both, e.g. `"playlist_cur_index": "3"`)
pub fn lenient_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn lenient_usize(value: Option<&Value>) -> Option<usize> {
    value
        .and_then(lenient_f64)
        .filter(|v| *v >= 0.0)
        .map(|v| v as usize)
}

/// Trimmed text, `None` when blank. Titles and URLs from the server and from
/// queued entries go through this so they compare equal.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    clean_text(value.and_then(|v| v.as_str()))
}

/// Wholesale snapshot of one remote player. Never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub mode: PlayerMode,
    pub power: bool,
    /// Index of the current track in the remote playlist
    pub playlist_position: usize,
    pub playlist_track_count: usize,
    pub elapsed_seconds: f64,
    pub duration_seconds: Option<f64>,
    /// Stream title; only set for radio/live sources
    pub current_title: Option<String>,
    /// `playlist_timestamp`; changes whenever the playlist content changes
    pub checksum: Option<String>,
    pub shuffle: bool,
    /// URL of the current track
    pub track_url: Option<String>,
    pub track_title: Option<String>,
}

impl ServerStatus {
    /// Build a snapshot from a `status` result.
    ///
    /// A result without a recognizable `mode`, or with a position outside
    /// the playlist, is a protocol error: the caller keeps its last snapshot.
    pub fn from_result(result: &Value) -> Result<Self, LmsError> {
        let mode_str = result
            .get("mode")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LmsError::Protocol("status without mode".to_string()))?;
        let mode = PlayerMode::parse(mode_str)
            .ok_or_else(|| LmsError::Protocol(format!("unknown mode {:?}", mode_str)))?;

        let playlist_track_count = lenient_usize(result.get("playlist_tracks")).unwrap_or(0);
        let playlist_position = lenient_usize(result.get("playlist_cur_index")).unwrap_or(0);
        if playlist_track_count > 0 && playlist_position >= playlist_track_count {
            return Err(LmsError::Protocol(format!(
                "playlist index {} outside {} tracks",
                playlist_position, playlist_track_count
            )));
        }

        let current = result
            .get("playlist_loop")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());

        let checksum = match result.get("playlist_timestamp") {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };

        Ok(Self {
            mode,
            power: result
                .get("power")
                .and_then(lenient_f64)
                .is_some_and(|p| p != 0.0),
            playlist_position,
            playlist_track_count,
            elapsed_seconds: result
                .get("time")
                .and_then(lenient_f64)
                .unwrap_or(0.0)
                .max(0.0),
            duration_seconds: result.get("duration").and_then(lenient_f64),
            current_title: non_empty_str(result.get("current_title")),
            checksum,
            shuffle: result
                .get("playlist shuffle")
                .and_then(lenient_f64)
                .is_some_and(|s| s != 0.0),
            track_url: non_empty_str(current.and_then(|c| c.get("url"))),
            track_title: non_empty_str(current.and_then(|c| c.get("title"))),
        })
    }

    /// A non-empty stream title marks a live source: no seeking, no title checks
    pub fn is_live_stream(&self) -> bool {
        self.current_title.is_some()
    }
}

/// One `playlist_loop` entry. Fields stay loosely typed; conversion into a
/// playable descriptor happens in the local player adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    #[serde(rename = "playlist index", default)]
    pub index: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub coverid: Option<Value>,
    #[serde(default)]
    pub remote_title: Option<String>,
}

impl PlaylistEntry {
    pub fn playlist_index(&self) -> Option<usize> {
        lenient_usize(self.index.as_ref())
    }
}
