//! Configuration management
//!
//! Layering (lowest to highest precedence):
//! 1. Built-in defaults (serde defaults on each section)
//! 2. `lms-sync-bridge.{toml,yaml,json}` in the config directory
//! 3. `LMSB__<SECTION>__<KEY>` environment variables
//! 4. Legacy `LMS_HOST` / `LMS_PORT` overrides

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

/// Base name of the optional config file (extension picked by the `config` crate)
const CONFIG_FILE_NAME: &str = "lms-sync-bridge";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lms: LmsConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LmsConfig {
    /// Server address; `None` means "discover on the local network"
    pub host: Option<String>,
    #[serde(default = "default_lms_port")]
    pub port: u16,
    #[serde(default = "default_cli_port")]
    pub cli_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MAC-style player reference; `None` picks the first player the server lists
    pub player_id: Option<String>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_cli_connect_timeout_ms")]
    pub cli_connect_timeout_ms: u64,
    #[serde(default = "default_cli_read_timeout_ms")]
    pub cli_read_timeout_ms: u64,
    #[serde(default = "default_max_liveness_failures")]
    pub max_liveness_failures: u32,
}

fn default_lms_port() -> u16 {
    9000
}

fn default_cli_port() -> u16 {
    9090
}

fn default_rpc_timeout_secs() -> u64 {
    20
}

fn default_cli_connect_timeout_ms() -> u64 {
    2000
}

fn default_cli_read_timeout_ms() -> u64 {
    1000
}

fn default_max_liveness_failures() -> u32 {
    5
}

impl Default for LmsConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_lms_port(),
            cli_port: default_cli_port(),
            username: None,
            password: None,
            player_id: None,
            rpc_timeout_secs: default_rpc_timeout_secs(),
            cli_connect_timeout_ms: default_cli_connect_timeout_ms(),
            cli_read_timeout_ms: default_cli_read_timeout_ms(),
            max_liveness_failures: default_max_liveness_failures(),
        }
    }
}

impl LmsConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn cli_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cli_connect_timeout_ms)
    }

    pub fn cli_read_timeout(&self) -> Duration {
        Duration::from_millis(self.cli_read_timeout_ms)
    }
}

/// Reconciliation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Local/remote elapsed drift tolerated before a corrective seek
    #[serde(default = "default_seek_tolerance_secs")]
    pub seek_tolerance_secs: f64,
    /// Number of playlist entries materialized into the local queue
    #[serde(default = "default_playlist_window")]
    pub playlist_window: usize,
    /// Upper bound on how long an unconfirmed command keeps `is_changing` set
    #[serde(default = "default_changing_timeout_ms")]
    pub changing_timeout_ms: u64,
    /// Upper bound on how long the busy flag may stay set
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_seek_settle_ms")]
    pub seek_settle_ms: u64,
    /// Consecutive poll failures before the server is reported unavailable
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_seek_tolerance_secs() -> f64 {
    2.0
}

fn default_playlist_window() -> usize {
    50
}

fn default_changing_timeout_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_seek_settle_ms() -> u64 {
    250
}

fn default_max_poll_failures() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            seek_tolerance_secs: default_seek_tolerance_secs(),
            playlist_window: default_playlist_window(),
            changing_timeout_ms: default_changing_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            seek_settle_ms: default_seek_settle_ms(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

impl SyncConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn changing_timeout(&self) -> Duration {
        Duration::from_millis(self.changing_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn seek_settle(&self) -> Duration {
        Duration::from_millis(self.seek_settle_ms)
    }
}

/// Silence proxy the local queue entries point at
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_proxy_port() -> u16 {
    8092
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
}

fn default_discovery_timeout_ms() -> u64 {
    3000
}

fn default_rescan_interval_ms() -> u64 {
    1000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            rescan_interval_ms: default_rescan_interval_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_port() -> u16 {
    8089
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

/// Get config directory (explicit env var, XDG_CONFIG_HOME, or ./data)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LMSB_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("lms-sync-bridge");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/lms-sync-bridge");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/lms-sync-bridge");
        }
    }

    PathBuf::from("./data")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .add_source(
            ::config::File::with_name(&config_dir.join(CONFIG_FILE_NAME).to_string_lossy())
                .required(false),
        )
        // LMSB__SYNC__TICK_MS=500, LMSB__LMS__PLAYER_ID=..., etc.
        .add_source(
            ::config::Environment::with_prefix("LMSB")
                .separator("__")
                .try_parsing(true),
        );

    // Legacy LMS_HOST/LMS_PORT env vars win over everything else
    if let Ok(host) = std::env::var("LMS_HOST") {
        builder = builder.set_override("lms.host", host)?;
    }
    if let Ok(port) = std::env::var("LMS_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("lms.port", port_num as i64)?;
        } else {
            tracing::warn!("Ignoring invalid LMS_PORT value: {}", port);
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}
