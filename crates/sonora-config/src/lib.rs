//! Shared configuration for the sonora relay and its command-line clients.
//!
//! One TOML file with a `[server]` and a `[client]` section, layered as
//! defaults → file → `SONORA_*` environment, and translated into
//! [`sonora_server::RelayConfig`] and [`sonora_core::ConnectionConfig`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use sonora_api::{SharedConfig, TransportConfig};
use sonora_core::ConnectionConfig;
use sonora_server::{BackoffPolicy, RelayConfig};

/// Environment prefix; nested keys use `__`, e.g. `SONORA_SERVER__LISTEN`.
pub const ENV_PREFIX: &str = "SONORA_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub client: ClientSection,
}

/// `[server]`: how `sonora serve` listens and where the device lives.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    /// Socket address to bind, e.g. "0.0.0.0:8090".
    pub listen: String,

    /// Path prefix for every route.
    pub base_path: String,

    /// Websocket URL of the upstream audio device.
    pub upstream_url: String,

    pub heartbeat_secs: u64,

    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,

    /// Free-form settings pushed to every session as the `config` event.
    pub shared: BTreeMap<String, serde_json::Value>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".into(),
            base_path: "/api".into(),
            upstream_url: "ws://127.0.0.1:9330/api".into(),
            heartbeat_secs: sonora_api::protocol::HEARTBEAT_INTERVAL_SECS,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 1_000,
            shared: BTreeMap::new(),
        }
    }
}

/// `[client]`: how `sonora watch` and `sonora send` reach a relay.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSection {
    /// Relay base URL including the base path.
    pub relay_url: String,

    /// Identity to re-attach to. Unset means "ask the relay for one".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Per-request deadline for short relay calls.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Accept self-signed certificates on the relay.
    pub insecure: bool,

    pub restart_spacing_ms: u64,
    pub health_check_secs: u64,
    pub max_auth_retries: u32,
    pub command_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8090/api".into(),
            client_id: None,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            insecure: false,
            restart_spacing_ms: 1_000,
            health_check_secs: 5,
            max_auth_retries: 1,
            command_timeout_secs: 30,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "sonora", "sonora").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("sonora");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// The full provider stack for `path`. A missing file is not an error.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load config from `path` (or the platform default) plus environment.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

impl Config {
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Serialize config to TOML at `path`, creating parent directories.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, cfg.to_toml()?)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

impl ServerSection {
    /// Build the relay's runtime configuration.
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let listen: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| invalid("server.listen", format!("'{}': {e}", self.listen)))?;

        let upstream_url = Url::parse(&self.upstream_url)
            .map_err(|e| invalid("server.upstream_url", format!("'{}': {e}", self.upstream_url)))?;
        if !matches!(upstream_url.scheme(), "ws" | "wss") {
            return Err(invalid(
                "server.upstream_url",
                format!("expected a ws:// or wss:// URL, got '{}'", self.upstream_url),
            ));
        }

        if self.heartbeat_secs == 0 {
            return Err(invalid("server.heartbeat_secs", "must be at least 1"));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(invalid(
                "server.reconnect_min_ms",
                format!(
                    "must be between 1 and reconnect_max_ms ({})",
                    self.reconnect_max_ms
                ),
            ));
        }

        let mut config = RelayConfig::new(upstream_url);
        config.listen = listen;
        config.base_path.clone_from(&self.base_path);
        config.heartbeat = Duration::from_secs(self.heartbeat_secs);
        config.backoff = BackoffPolicy {
            min_delay: Duration::from_millis(self.reconnect_min_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_jitter: Duration::from_millis(self.reconnect_jitter_ms),
        };
        config.shared = SharedConfig {
            settings: self
                .shared
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(config)
    }
}

impl ClientSection {
    /// Build a client connection configuration.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let relay_url = Url::parse(&self.relay_url)
            .map_err(|e| invalid("client.relay_url", format!("'{}': {e}", self.relay_url)))?;
        if !matches!(relay_url.scheme(), "http" | "https") {
            return Err(invalid(
                "client.relay_url",
                format!("expected an http:// or https:// URL, got '{}'", self.relay_url),
            ));
        }
        if self.health_check_secs == 0 {
            return Err(invalid("client.health_check_secs", "must be at least 1"));
        }

        let mut config = ConnectionConfig::new(relay_url);
        config.client_id.clone_from(&self.client_id);
        config.transport = TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.timeout_secs),
            accept_invalid_certs: self.insecure,
        };
        config.restart_spacing = Duration::from_millis(self.restart_spacing_ms);
        config.health_check_period = Duration::from_secs(self.health_check_secs);
        config.max_auth_retries = self.max_auth_retries;
        config.command_timeout = Duration::from_secs(self.command_timeout_secs);
        Ok(config)
    }
}
