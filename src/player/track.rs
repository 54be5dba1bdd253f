//! Queue entries for the host player.
//!
//! The host plays silence from the local proxy; the descriptor only carries
//! metadata and a proxy address sized to the remote track.

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::sync::status::{clean_text, PlaylistEntry};

/// Path the silence proxy serves for unbounded streams
pub const RADIO_PATH: &str = "/track/radio";

/// Normalize a wire duration to whole seconds.
///
/// Accepts integers, floats and numeric strings (`245`, `245.0`, `"245"`),
/// truncating fractions. Anything else is logged and treated as unknown,
/// which makes the entry a radio stream.
pub fn coerce_duration(value: &Value) -> Option<u32> {
    let seconds = match value {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match seconds {
        Some(s) if s.is_finite() && s >= 0.0 => Some(s.min(u32::MAX as f64) as u32),
        _ => {
            error!("track: unusable duration {}", value);
            None
        }
    }
}

/// Proxy address for a track of `duration` seconds (radio when unknown or zero)
pub fn silence_address(proxy_port: u16, duration: Option<u32>) -> String {
    match duration {
        Some(d) if d > 0 => format!("http://127.0.0.1:{}/track/{}.wav", proxy_port, d),
        _ => format!("http://127.0.0.1:{}{}", proxy_port, RADIO_PATH),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackDescriptor {
    /// Index in the remote playlist
    pub playlist_index: usize,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<u32>,
    pub artwork: Option<String>,
    /// Remote track URL, kept to detect local track advances
    pub remote_url: Option<String>,
    /// What the host actually plays
    pub address: String,
    pub is_radio: bool,
}

impl TrackDescriptor {
    pub fn from_entry(entry: &PlaylistEntry, fallback_index: usize, proxy_port: u16) -> Self {
        let duration = entry.duration.as_ref().and_then(coerce_duration);
        let remote_title = clean_text(entry.remote_title.as_deref());
        let is_radio = remote_title.is_some() || !duration.is_some_and(|d| d > 0);

        let artwork = entry.artwork_url.clone().or_else(|| {
            entry.coverid.as_ref().and_then(|id| match id {
                Value::String(s) if !s.is_empty() => Some(format!("/music/{}/cover", s)),
                Value::Number(n) => Some(format!("/music/{}/cover", n)),
                _ => None,
            })
        });

        let title = remote_title
            .or_else(|| clean_text(entry.title.as_deref()))
            .unwrap_or_default();

        Self {
            playlist_index: entry.playlist_index().unwrap_or(fallback_index),
            title,
            artist: entry.artist.clone(),
            album: entry.album.clone(),
            duration: if is_radio { None } else { duration },
            artwork,
            remote_url: clean_text(entry.url.as_deref()),
            address: silence_address(proxy_port, if is_radio { None } else { duration }),
            is_radio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_encodings_agree() {
        assert_eq!(coerce_duration(&json!("245")), Some(245));
        assert_eq!(coerce_duration(&json!(245.0)), Some(245));
        assert_eq!(coerce_duration(&json!(245)), Some(245));
        assert_eq!(coerce_duration(&json!("245.9")), Some(245));
    }

    #[test]
    fn test_unusable_duration_is_unknown() {
        assert_eq!(coerce_duration(&json!("four minutes")), None);
        assert_eq!(coerce_duration(&json!(-3)), None);
        assert_eq!(coerce_duration(&json!([245])), None);
        assert_eq!(coerce_duration(&json!(null)), None);
    }

    #[test]
    fn test_silence_address() {
        assert_eq!(
            silence_address(8092, Some(245)),
            "http://127.0.0.1:8092/track/245.wav"
        );
        assert_eq!(
            silence_address(8092, Some(0)),
            "http://127.0.0.1:8092/track/radio"
        );
        assert_eq!(silence_address(8092, None), "http://127.0.0.1:8092/track/radio");
    }

    #[test]
    fn test_file_entry() {
        let entry: PlaylistEntry = serde_json::from_value(json!({
            "playlist index": 3,
            "title": "Freddie Freeloader",
            "artist": "Miles Davis",
            "duration": "589.4",
            "url": "file:///music/kob/02.flac",
            "coverid": "9f8e7d"
        }))
        .unwrap();

        let track = TrackDescriptor::from_entry(&entry, 0, 8092);
        assert_eq!(track.playlist_index, 3);
        assert_eq!(track.duration, Some(589));
        assert!(!track.is_radio);
        assert_eq!(track.address, "http://127.0.0.1:8092/track/589.wav");
        assert_eq!(track.artwork.as_deref(), Some("/music/9f8e7d/cover"));
        assert_eq!(track.remote_url.as_deref(), Some("file:///music/kob/02.flac"));
    }

    #[test]
    fn test_titles_are_trimmed_like_server_status() {
        let entry: PlaylistEntry = serde_json::from_value(json!({
            "title": "  So What \t",
            "duration": 545,
            "url": " file:///music/kob/01.flac "
        }))
        .unwrap();
        let track = TrackDescriptor::from_entry(&entry, 0, 8092);
        assert_eq!(track.title, "So What");
        assert_eq!(track.remote_url.as_deref(), Some("file:///music/kob/01.flac"));

        let status = crate::sync::status::ServerStatus::from_result(&json!({
            "mode": "play",
            "playlist_tracks": 1,
            "playlist_loop": [{"title": "  So What \t", "url": " file:///music/kob/01.flac "}]
        }))
        .unwrap();
        assert_eq!(status.track_title.as_deref(), Some(track.title.as_str()));
        assert_eq!(status.track_url, track.remote_url);
    }

    #[test]
    fn test_radio_entries() {
        let stream: PlaylistEntry = serde_json::from_value(json!({
            "title": "Jazz FM",
            "remote_title": "Jazz FM - Late Show",
            "duration": 0,
            "artwork_url": "http://example.com/logo.png"
        }))
        .unwrap();
        let track = TrackDescriptor::from_entry(&stream, 7, 8092);
        assert!(track.is_radio);
        assert_eq!(track.playlist_index, 7);
        assert_eq!(track.title, "Jazz FM - Late Show");
        assert_eq!(track.address, "http://127.0.0.1:8092/track/radio");
        assert_eq!(track.artwork.as_deref(), Some("http://example.com/logo.png"));

        let blank: PlaylistEntry =
            serde_json::from_value(json!({"title": "Song", "remote_title": "  ", "duration": 200}))
                .unwrap();
        assert!(!TrackDescriptor::from_entry(&blank, 0, 8092).is_radio);

        let broken: PlaylistEntry =
            serde_json::from_value(json!({"title": "Odd", "duration": "n/a"})).unwrap();
        let track = TrackDescriptor::from_entry(&broken, 0, 8092);
        assert!(track.is_radio);
        assert!(track.duration.is_none());
    }
}
