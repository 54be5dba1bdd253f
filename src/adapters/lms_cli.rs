//! LMS CLI notification listener (telnet, port 9090)
//!
//! One persistent, line-oriented TCP session per server:
//!
//! ```text
//! -> login admin secret
//! <- login admin ******
//! -> subscribe playlist,mixer,power,client
//! <- subscribe playlist%2Cmixer%2Cpower%2Cclient
//! <- 00%3A04%3A20%3Aaa%3Abb%3Acc playlist pause 1
//! <- 00%3A04%3A20%3Aaa%3Abb%3Acc mixer volume 75
//! ```
//!
//! Every notification line is percent-decoded token by token and handed to
//! the first registered handler whose prefix occurs in the event text.
//! Handlers run inline on the listener task, so they must be short and must
//! not block: anything slow belongs on another task (wake it via `Notify`).
//!
//! Reconnection is owned by `AdapterHandle`: a broken session returns `Err`,
//! `on_failure` decides between retry (server still accepts connections) and
//! giving up (bad credentials, or the liveness probe kept failing).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::adapters::lms::LmsError;
use crate::adapters::traits::{AdapterContext, AdapterLogic, RetryDecision};
use crate::bus::{BusEvent, SharedBus};

/// What LMS echoes in place of the password on a successful login
const MASKED_PASSWORD: &str = "******";

// =============================================================================
// Notifications
// =============================================================================

/// One decoded notification line: `<player_ref> <event tokens...>`
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub player_id: String,
    /// Decoded tokens after the player ref
    pub tokens: Vec<String>,
    /// Decoded tokens joined with single spaces (what handler prefixes match)
    pub event: String,
}

fn decode_token(token: &str) -> String {
    urlencoding::decode(token)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| token.to_string())
}

impl Notification {
    /// Parse a raw CLI line. Returns `None` for blank lines, command echoes
    /// and lines without an event after the player ref.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let first = parts.next()?;
        if matches!(first, "subscribe" | "listen" | "login") {
            return None;
        }
        let tokens: Vec<String> = parts.map(decode_token).collect();
        if tokens.is_empty() {
            return None;
        }
        Some(Self {
            player_id: decode_token(first),
            event: tokens.join(" "),
            tokens,
        })
    }

    /// Typed view of the notification
    pub fn kind(&self) -> CliEvent {
        let arg = |i: usize| self.tokens.get(i).map(String::as_str);
        match arg(0) {
            Some("playlist") => CliEvent::Playlist {
                command: arg(1).unwrap_or("").to_string(),
                args: self.tokens.iter().skip(2).cloned().collect(),
            },
            Some("mixer") => CliEvent::Mixer {
                param: arg(1).unwrap_or("volume").to_string(),
                value: arg(2).and_then(|s| s.parse().ok()),
            },
            Some("power") => CliEvent::Power {
                on: arg(1) == Some("1"),
            },
            Some("client") => CliEvent::Client {
                action: arg(1).unwrap_or("unknown").to_string(),
            },
            _ => CliEvent::Unknown,
        }
    }
}

/// Notification categories the bridge reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum CliEvent {
    /// `playlist <command> <args...>` (newsong, pause, jump, loadtracks, ...)
    Playlist { command: String, args: Vec<String> },
    /// `mixer <param> <value>`; value is None when it is not an integer
    Mixer { param: String, value: Option<i32> },
    /// `power 0|1`
    Power { on: bool },
    /// `client new|disconnect|reconnect|forget`
    Client { action: String },
    Unknown,
}

// =============================================================================
// Handler registry
// =============================================================================

pub type NotificationHandler = Box<dyn Fn(&Notification) + Send + Sync>;

/// Event-prefix → handler mapping, built once at startup.
///
/// Dispatch is first match in registration order, so register specific
/// prefixes (`playlist pause`) before general ones (`playlist`).
#[derive(Default)]
pub struct NotificationHandlers {
    entries: Vec<(String, NotificationHandler)>,
}

impl NotificationHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, prefix: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.entries.push((prefix.into(), Box::new(handler)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level notification names to subscribe to, de-duplicated, in
    /// registration order (`playlist pause` and `playlist` both yield `playlist`)
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (prefix, _) in &self.entries {
            if let Some(name) = prefix.split_whitespace().next() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// Command that tells the server what to send us
    pub fn subscribe_command(&self) -> String {
        if self.is_empty() {
            "listen 1\n".to_string()
        } else {
            format!("subscribe {}\n", self.subscriptions().join(","))
        }
    }

    /// Invoke the first handler whose prefix occurs in the event.
    /// Returns the matched prefix.
    pub fn dispatch(&self, notification: &Notification) -> Option<&str> {
        let (prefix, handler) = self
            .entries
            .iter()
            .find(|(prefix, _)| notification.event.contains(prefix.as_str()))?;
        handler(notification);
        Some(prefix.as_str())
    }
}

// =============================================================================
// Listener
// =============================================================================

#[derive(Debug, Clone)]
pub struct CliSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Upper bound on a single read; keeps the session loop responsive
    pub read_timeout: Duration,
    /// Consecutive failed liveness probes before the listener gives up
    pub max_liveness_failures: u32,
}

impl CliSettings {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Persistent notification session, restarted in place by `AdapterHandle`
pub struct CliListener {
    settings: CliSettings,
    handlers: Arc<NotificationHandlers>,
    liveness_failures: AtomicU32,
}

impl CliListener {
    pub fn new(settings: CliSettings, handlers: NotificationHandlers) -> Self {
        Self {
            settings,
            handlers: Arc::new(handlers),
            liveness_failures: AtomicU32::new(0),
        }
    }

    async fn connect(&self) -> Result<TcpStream, LmsError> {
        let address = self.settings.address();
        match timeout(self.settings.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(LmsError::Connection {
                endpoint: address,
                message: e.to_string(),
            }),
            Err(_) => Err(LmsError::Connection {
                endpoint: address,
                message: "connect timed out".to_string(),
            }),
        }
    }

    /// Lightweight reachability check: can we still open a TCP connection?
    pub async fn probe(&self) -> bool {
        self.connect().await.is_ok()
    }

    async fn login(
        &self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), LmsError> {
        // Sent even without credentials; an open server acknowledges any login
        let username = self.settings.username.as_deref().unwrap_or("");
        let password = self.settings.password.as_deref().unwrap_or("");
        let command = format!(
            "login {} {}\n",
            urlencoding::encode(username),
            urlencoding::encode(password)
        );
        writer
            .write_all(command.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;

        match timeout(self.settings.connect_timeout, lines.next_line()).await {
            Ok(Ok(Some(reply))) if is_login_ack(&reply) => Ok(()),
            Ok(Ok(Some(reply))) => Err(LmsError::Authentication(format!(
                "unexpected login reply: {}",
                reply.trim()
            ))),
            // LMS drops the connection on bad credentials
            Ok(Ok(None)) => Err(LmsError::Authentication(
                "connection closed during login".to_string(),
            )),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(LmsError::Connection {
                endpoint: self.settings.address(),
                message: "no login reply".to_string(),
            }),
        }
    }

    fn io_error(&self, e: std::io::Error) -> LmsError {
        LmsError::Connection {
            endpoint: self.settings.address(),
            message: e.to_string(),
        }
    }

    fn handle_line(&self, line: &str, bus: &SharedBus) {
        let Some(notification) = Notification::parse(line) else {
            debug!("lms-cli: ignoring line: {}", line.trim());
            return;
        };

        bus.publish(BusEvent::CliNotification {
            player_id: notification.player_id.clone(),
            event: notification.event.clone(),
        });

        match self.handlers.dispatch(&notification) {
            Some(prefix) => debug!(
                player_id = %notification.player_id,
                prefix,
                "lms-cli: {}",
                notification.event
            ),
            None => debug!(
                player_id = %notification.player_id,
                "lms-cli: unhandled: {}",
                notification.event
            ),
        }
    }

    async fn session(&self, ctx: &AdapterContext) -> Result<()> {
        let host = self.settings.host.clone();
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        self.login(&mut lines, &mut writer).await?;

        let subscribe = self.handlers.subscribe_command();
        writer
            .write_all(subscribe.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;

        self.liveness_failures.store(0, Ordering::SeqCst);
        info!("lms-cli: connected to {} ({})", self.settings.address(), subscribe.trim());
        ctx.bus.publish(BusEvent::CliConnected { host: host.clone() });

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    info!("lms-cli: shutdown requested");
                    return Ok(());
                }
                read = timeout(self.settings.read_timeout, lines.next_line()) => {
                    match read {
                        // Idle; loop again so cancellation is observed
                        Err(_) => continue,
                        Ok(Ok(Some(line))) => self.handle_line(&line, &ctx.bus),
                        Ok(Ok(None)) => {
                            ctx.bus.publish(BusEvent::CliDisconnected {
                                host: host.clone(),
                                reason: Some("connection closed by server".to_string()),
                            });
                            return Err(LmsError::Connection {
                                endpoint: self.settings.address(),
                                message: "connection closed by server".to_string(),
                            }
                            .into());
                        }
                        Ok(Err(e)) => {
                            ctx.bus.publish(BusEvent::CliDisconnected {
                                host: host.clone(),
                                reason: Some(e.to_string()),
                            });
                            return Err(self.io_error(e).into());
                        }
                    }
                }
            }
        }
    }
}

/// `login <user> ******` (some servers reply with just the mask)
pub fn is_login_ack(reply: &str) -> bool {
    reply
        .split_whitespace()
        .last()
        .map(decode_token)
        .is_some_and(|last| last == MASKED_PASSWORD)
}

#[async_trait]
impl AdapterLogic for CliListener {
    fn prefix(&self) -> &'static str {
        "lms-cli"
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        self.session(&ctx).await
    }

    async fn on_failure(&self, error: &anyhow::Error) -> RetryDecision {
        if error
            .downcast_ref::<LmsError>()
            .is_some_and(LmsError::is_fatal)
        {
            error!("lms-cli: authentication failed, not retrying");
            return RetryDecision::GiveUp;
        }

        if self.probe().await {
            self.liveness_failures.store(0, Ordering::SeqCst);
            return RetryDecision::Retry;
        }

        let failures = self.liveness_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.settings.max_liveness_failures {
            error!(
                "lms-cli: {} unreachable after {} probes, giving up",
                self.settings.address(),
                failures
            );
            RetryDecision::GiveUp
        } else {
            warn!(
                "lms-cli: {} not accepting connections ({}/{})",
                self.settings.address(),
                failures,
                self.settings.max_liveness_failures
            );
            RetryDecision::Retry
        }
    }
}
