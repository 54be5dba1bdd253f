//! Mock LMS (Logitech Media Server) for testing
//!
//! Simulates the JSON-RPC interface at /jsonrpc.js with a mutable player
//! and records every command it receives.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One playlist entry
#[derive(Debug, Clone)]
pub struct MockTrack {
    pub title: String,
    pub url: String,
    /// Sent as-is, so tests can use numbers or strings
    pub duration: Value,
    pub remote_title: Option<String>,
}

impl MockTrack {
    pub fn file(index: usize) -> Self {
        Self {
            title: format!("Track {}", index),
            url: format!("file:///music/{}.flac", index),
            duration: json!(200),
            remote_title: None,
        }
    }
}

/// Mock player state
#[derive(Debug, Clone)]
pub struct MockPlayer {
    pub playerid: String,
    pub name: String,
    pub power: bool,
    pub mode: String, // "play", "pause", "stop"
    pub time: f64,
    pub shuffle: bool,
    pub playlist: Vec<MockTrack>,
    pub cur_index: usize,
    pub timestamp: f64,
    /// Stream title of a live source
    pub current_title: Option<String>,
}

impl MockPlayer {
    pub fn new(playerid: &str, name: &str) -> Self {
        Self {
            playerid: playerid.to_string(),
            name: name.to_string(),
            power: true,
            mode: "stop".to_string(),
            time: 0.0,
            shuffle: false,
            playlist: Vec::new(),
            cur_index: 0,
            timestamp: 1_700_000_000.25,
            current_title: None,
        }
    }

    fn entry(&self, index: usize) -> Option<Value> {
        let track = self.playlist.get(index)?;
        let mut entry = json!({
            "playlist index": index,
            "id": 1000 + index,
            "title": track.title,
            "url": track.url,
            "duration": track.duration,
            "coverid": format!("cover{}", index),
        });
        if let Some(remote_title) = &track.remote_title {
            entry["remote_title"] = json!(remote_title);
        }
        Some(entry)
    }
}

/// Mock LMS server state
#[derive(Default)]
struct MockLmsState {
    players: HashMap<String, MockPlayer>,
    /// (player ref, command tokens rendered as text)
    commands: Vec<(String, String)>,
    /// Delay before every answer
    delay: Option<Duration>,
    unauthorized: bool,
}

/// Mock LMS Server
pub struct MockLmsServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockLmsState>>,
    handle: JoinHandle<()>,
}

impl MockLmsServer {
    /// Start a mock LMS server on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockLmsState::default()));

        let app = Router::new()
            .route("/jsonrpc.js", post(handle_jsonrpc))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Get the server address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Add a player to the mock server
    pub async fn add_player(&self, playerid: &str, name: &str) {
        let mut state = self.state.write().await;
        state
            .players
            .insert(playerid.to_string(), MockPlayer::new(playerid, name));
    }

    /// Mutate one player
    pub async fn update<F>(&self, playerid: &str, f: F)
    where
        F: FnOnce(&mut MockPlayer),
    {
        let mut state = self.state.write().await;
        if let Some(player) = state.players.get_mut(playerid) {
            f(player);
        }
    }

    pub async fn set_mode(&self, playerid: &str, mode: &str) {
        self.update(playerid, |p| p.mode = mode.to_string()).await;
    }

    pub async fn set_time(&self, playerid: &str, time: f64) {
        self.update(playerid, |p| p.time = time).await;
    }

    pub async fn set_playlist(&self, playerid: &str, tracks: Vec<MockTrack>) {
        self.update(playerid, |p| {
            p.playlist = tracks;
            p.cur_index = 0;
            p.timestamp += 1.0;
        })
        .await;
    }

    /// Simulate an out-of-band playlist edit
    pub async fn touch_playlist(&self, playerid: &str) {
        self.update(playerid, |p| p.timestamp += 1.0).await;
    }

    pub async fn player(&self, playerid: &str) -> Option<MockPlayer> {
        self.state.read().await.players.get(playerid).cloned()
    }

    /// Commands other than queries, oldest first
    pub async fn commands(&self, playerid: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .commands
            .iter()
            .filter(|(player, cmd)| {
                player == playerid && !cmd.starts_with("status") && !cmd.starts_with("players")
            })
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    pub async fn set_unauthorized(&self, unauthorized: bool) {
        self.state.write().await.unauthorized = unauthorized;
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

/// JSON-RPC request format
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    id: Value,
    method: String,
    params: Vec<Value>,
}

/// JSON-RPC response format
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    id: Value,
    result: Value,
}

fn token_text(v: &Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

fn token_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Handle JSON-RPC requests
async fn handle_jsonrpc(
    State(state): State<Arc<RwLock<MockLmsState>>>,
    Json(request): Json<JsonRpcRequest>,
) -> Result<Json<JsonRpcResponse>, StatusCode> {
    let (delay, unauthorized) = {
        let state = state.read().await;
        (state.delay, state.unauthorized)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if unauthorized {
        return Err(StatusCode::UNAUTHORIZED);
    }

    if request.method != "slim.request" || request.params.len() < 2 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let player_id = request.params[0].as_str().unwrap_or("").to_string();
    let commands = request.params[1]
        .as_array()
        .ok_or(StatusCode::BAD_REQUEST)?
        .clone();
    let command = commands
        .first()
        .and_then(|v| v.as_str())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();

    let mut state = state.write().await;
    let rendered = commands.iter().map(token_text).collect::<Vec<_>>().join(" ");
    state.commands.push((player_id.clone(), rendered));

    if command == "players" {
        let players_loop: Vec<Value> = state
            .players
            .values()
            .map(|p| {
                json!({
                    "playerid": p.playerid,
                    "name": p.name,
                    "model": "squeezelite",
                    "connected": 1,
                    "power": if p.power { 1 } else { 0 },
                })
            })
            .collect();
        return Ok(Json(JsonRpcResponse {
            id: request.id,
            result: json!({"count": players_loop.len(), "players_loop": players_loop}),
        }));
    }

    let Some(player) = state.players.get_mut(&player_id) else {
        return Ok(Json(JsonRpcResponse {
            id: request.id,
            result: json!({}),
        }));
    };

    let result = match command.as_str() {
        "status" => {
            let start = commands.get(1).map(token_text).unwrap_or_default();
            if start == "-" {
                let mut status = json!({
                    "mode": player.mode,
                    "power": if player.power { 1 } else { 0 },
                    "time": player.time,
                    "playlist_tracks": player.playlist.len(),
                    "playlist_timestamp": player.timestamp,
                    "playlist shuffle": if player.shuffle { 1 } else { 0 },
                    "playlist_loop": player.entry(player.cur_index).into_iter().collect::<Vec<_>>(),
                });
                if !player.playlist.is_empty() {
                    status["playlist_cur_index"] = json!(player.cur_index.to_string());
                    status["duration"] = player.playlist[player.cur_index].duration.clone();
                }
                if let Some(title) = &player.current_title {
                    status["current_title"] = json!(title);
                }
                status
            } else {
                let start = start.parse::<usize>().unwrap_or(0);
                let count = token_f64(commands.get(2)).unwrap_or(1.0) as usize;
                let entries: Vec<Value> = (start..start.saturating_add(count))
                    .filter_map(|i| player.entry(i))
                    .collect();
                json!({
                    "playlist_tracks": player.playlist.len(),
                    "playlist_loop": entries,
                })
            }
        }
        "play" => {
            // Real LMS: "play" does not resume from pause
            if player.mode == "stop" {
                player.mode = "play".to_string();
            }
            json!({})
        }
        "pause" => {
            match token_f64(commands.get(1)).map(|v| v as i64) {
                Some(0) if player.mode == "pause" => player.mode = "play".to_string(),
                Some(1) if player.mode == "play" => player.mode = "pause".to_string(),
                None => {
                    player.mode = match player.mode.as_str() {
                        "play" => "pause".to_string(),
                        "pause" => "play".to_string(),
                        other => other.to_string(),
                    }
                }
                _ => {}
            }
            json!({})
        }
        "stop" => {
            player.mode = "stop".to_string();
            json!({})
        }
        "time" => {
            let arg = commands.get(1).map(token_text).unwrap_or_default();
            if let Ok(value) = arg.parse::<f64>() {
                if arg.starts_with('+') || arg.starts_with('-') {
                    player.time = (player.time + value).max(0.0);
                } else {
                    player.time = value;
                }
            }
            json!({})
        }
        "power" => {
            let on = token_f64(commands.get(1)).is_some_and(|v| v != 0.0);
            player.power = on;
            if !on {
                player.mode = "stop".to_string();
            }
            json!({})
        }
        "playlist" => {
            let sub = commands.get(1).map(token_text).unwrap_or_default();
            let arg = commands.get(2).map(token_text).unwrap_or_default();
            if sub == "index" {
                let len = player.playlist.len();
                let target = if arg.starts_with('+') || arg.starts_with('-') {
                    arg.parse::<i64>()
                        .ok()
                        .map(|delta| player.cur_index as i64 + delta)
                } else {
                    arg.parse::<i64>().ok()
                };
                if let Some(t) = target.filter(|t| *t >= 0 && (*t as usize) < len) {
                    player.cur_index = t as usize;
                    player.time = 0.0;
                }
            }
            json!({})
        }
        _ => json!({}),
    };

    Ok(Json(JsonRpcResponse {
        id: request.id,
        result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rpc(addr: SocketAddr, player_id: &str, cmd: Value) -> Value {
        let response = reqwest::Client::new()
            .post(format!("http://{}/jsonrpc.js", addr))
            .json(&json!({
                "id": 1,
                "method": "slim.request",
                "params": [player_id, cmd]
            }))
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        body["result"].clone()
    }

    #[tokio::test]
    async fn mock_lms_reports_status_and_window() {
        let server = MockLmsServer::start().await;
        let player_id = "aa:bb:cc:dd:ee:ff";
        server.add_player(player_id, "Test Player").await;
        server
            .set_playlist(player_id, (0..3).map(MockTrack::file).collect())
            .await;
        server.set_mode(player_id, "play").await;

        let status = rpc(server.addr(), player_id, json!(["status", "-", 1, "tags:a"])).await;
        assert_eq!(status["mode"], "play");
        assert_eq!(status["playlist_tracks"], 3);
        assert_eq!(status["playlist_loop"][0]["title"], "Track 0");

        let window = rpc(server.addr(), player_id, json!(["status", 1, 5, "tags:a"])).await;
        assert_eq!(window["playlist_loop"].as_array().unwrap().len(), 2);
        assert_eq!(window["playlist_loop"][0]["playlist index"], 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn mock_lms_power_off_stops() {
        let server = MockLmsServer::start().await;
        let player_id = "aa:bb:cc:dd:ee:ff";
        server.add_player(player_id, "Test Player").await;
        server.set_mode(player_id, "play").await;

        rpc(server.addr(), player_id, json!(["power", 0])).await;
        let player = server.player(player_id).await.unwrap();
        assert!(!player.power);
        assert_eq!(player.mode, "stop");
        assert_eq!(server.commands(player_id).await, vec!["power 0"]);

        server.stop().await;
    }
}
