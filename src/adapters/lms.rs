//! LMS (Logitech Media Server) JSON-RPC client
//!
//! Implements the request/response half of the LMS control protocol:
//! `POST /jsonrpc.js` with a `slim.request` body.
//! Documentation: http://HOST:9000/html/docs/cli-api.html
//!
//! The notification half (telnet CLI on port 9090) lives in `lms_cli`.
//!
//! ## Wire format
//!
//! ```text
//! {"id": 12, "method": "slim.request", "params": ["00:04:20:aa:bb:cc", ["pause", "1"]]}
//! {"id": 12, "method": "slim.request", "result": {...}}
//! ```
//!
//! Player ref `-` addresses the server itself (`players`, `serverstatus`, ...).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Player ref used for server-scope commands
pub const SERVER_REF: &str = "-";

/// Failure taxonomy for everything that talks to LMS.
///
/// The listener and the server state model pick their retry policy from the
/// variant: `Authentication` is never retried, `Connection` is retried with
/// backoff by long-lived tasks, `TransientUnavailable` only marks the snapshot
/// stale, `Protocol` skips the current reconciliation tick.
#[derive(Debug, Error)]
pub enum LmsError {
    #[error("LMS unreachable at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("LMS rejected credentials: {0}")]
    Authentication(String),

    #[error("LMS temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("unexpected LMS response: {0}")]
    Protocol(String),
}

impl LmsError {
    /// Errors that must stop the caller instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Reachability failures (as opposed to a server that answered badly)
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::TransientUnavailable(_)
        )
    }

    fn from_transport(err: reqwest::Error, endpoint: &str) -> Self {
        if err.is_timeout() {
            Self::TransientUnavailable(format!("request to {} timed out", endpoint))
        } else if err.is_decode() {
            Self::Protocol(format!("undecodable response body: {}", err))
        } else {
            Self::Connection {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Where and how to reach a server
#[derive(Debug, Clone)]
pub struct LmsEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl LmsEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

/// Player entry from `players 0 <n>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmsPlayer {
    pub playerid: String,
    pub name: String,
    pub model: String,
    pub connected: bool,
    pub power: bool,
    pub ip: Option<String>,
}

/// JSON-RPC client. Cheap to clone; clones share the request id counter.
#[derive(Clone)]
pub struct LmsRpc {
    endpoint: Arc<LmsEndpoint>,
    url: Url,
    client: Client,
    next_id: Arc<AtomicU64>,
}

impl LmsRpc {
    pub fn new(endpoint: LmsEndpoint, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(&format!("http://{}:{}/", endpoint.host, endpoint.port))
            .and_then(|base| base.join("jsonrpc.js"))
            .with_context(|| format!("invalid LMS address {}:{}", endpoint.host, endpoint.port))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            url,
            client,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one command and wait for its result.
    ///
    /// Returns the `result` member (or `Null` when the command has no result).
    pub async fn send_command(
        &self,
        player_ref: &str,
        tokens: Vec<Value>,
    ) -> Result<Value, LmsError> {
        let id = self.next_request_id();
        let body = json!({
            "id": id,
            "method": "slim.request",
            "params": [player_ref, tokens]
        });

        debug!(id, player_ref, params = ?body["params"][1], "LMS request");

        let mut request = self.client.post(self.url.clone()).json(&body);
        if let Some(username) = &self.endpoint.username {
            request = request.basic_auth(username, self.endpoint.password.as_ref());
        }

        let endpoint = self.url.as_str();
        let response = request
            .send()
            .await
            .map_err(|e| LmsError::from_transport(e, endpoint))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(LmsError::Authentication(format!(
                    "HTTP 401 from {}",
                    endpoint
                )))
            }
            status if !status.is_success() => {
                return Err(LmsError::Protocol(format!(
                    "HTTP {} from {}",
                    status, endpoint
                )))
            }
            _ => {}
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LmsError::from_transport(e, endpoint))?;

        debug!(id, player_ref, result = ?data.get("result"), "LMS response");

        if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
            return Err(LmsError::Protocol(format!("LMS error: {}", error)));
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// List the players the server knows about
    pub async fn get_players(&self) -> Result<Vec<LmsPlayer>, LmsError> {
        let result = self
            .send_command(SERVER_REF, vec![json!("players"), json!(0), json!(100)])
            .await?;

        let players_loop = result
            .get("players_loop")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(players_loop
            .into_iter()
            .map(|p| LmsPlayer {
                playerid: p
                    .get("playerid")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                name: p
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                model: p
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
                connected: p.get("connected").and_then(|v| v.as_i64()).unwrap_or(0) == 1,
                power: p.get("power").and_then(|v| v.as_i64()).unwrap_or(0) == 1,
                ip: p.get("ip").and_then(|v| v.as_str()).map(|s| s.to_string()),
            })
            .filter(|p| !p.playerid.is_empty())
            .collect())
    }
}
