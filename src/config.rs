//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CHATBRIDGE_API_KEY`, `CHATBRIDGE_LISTEN`,
//!    `CHATBRIDGE_BOT_TOKEN`, `CHATBRIDGE_WORKSPACE_ID`, `CHATBRIDGE_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `chatbridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! data_dir = "/var/lib/chatbridge"
//! autostart = true
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [gateway]
//! bot_token = "..."
//! discovery_url = "https://discord.com/api/gateway"
//! api_version = 10
//! intents = 513                 # GUILDS | GUILD_MESSAGES
//! auto_reconnect = true
//! handshake_timeout_secs = 30
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! max_connect_attempts = 5
//! ignore_bots = true
//!
//! [forward]
//! api_base = "https://api.clickup.com"
//! workspace_id = "9012345678"
//! request_timeout_secs = 30
//!
//! [store]
//! capacity = 100
//! persist = true
//! unmapped_policy = "drop"      # or "store"
//!
//! [channels]                    # source channel id = destination channel id
//! "1087467843584532510" = "6-901209555432-8"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "chatbridge.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Static routing table: source channel id → destination channel id.
    #[serde(default)]
    pub channels: HashMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP API and process-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for the message store, token file, and pid marker.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Start the gateway session when `serve` starts (default true).
    #[serde(default = "default_true")]
    pub autostart: bool,
}

/// Authentication for the HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared key. Override with `CHATBRIDGE_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Gateway session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Bot credential sent in Identify. Override with `CHATBRIDGE_BOT_TOKEN`.
    #[serde(default)]
    pub bot_token: String,
    /// Endpoint returning `{"url": "wss://..."}`.
    #[serde(default = "default_discovery_url")]
    pub discovery_url: String,
    /// Gateway protocol version appended as `?v=`.
    #[serde(default = "default_api_version")]
    pub api_version: u32,
    /// Capability bitmask sent in Identify (default 513).
    #[serde(default = "default_intents")]
    pub intents: u64,
    /// Reconnect after a post-Ready disconnect (default true).
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Seconds allowed for Connecting → Ready (default 30).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Backoff ceiling in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Consecutive failed attempts before the start is declared fatal (default 5).
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Skip messages whose author is a bot (default true).
    #[serde(default = "default_true")]
    pub ignore_bots: bool,
    /// Client name reported in Identify properties.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

/// Downstream chat API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// API origin (default `https://api.clickup.com`).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Workspace owning the destination channels. Override with `CHATBRIDGE_WORKSPACE_ID`.
    #[serde(default)]
    pub workspace_id: String,
    /// Total request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// What to do with messages from channels that have no mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedPolicy {
    /// Ignore them entirely.
    #[default]
    Drop,
    /// Record them in the store but never forward.
    Store,
}

/// Message store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Retention bound: only the N most recently created records are kept (default 100).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Persist to `<data_dir>/messages.json` (default true).
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default)]
    pub unmapped_policy: UnmappedPolicy,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/chatbridge".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_discovery_url() -> String {
    "https://discord.com/api/gateway".to_string()
}
fn default_api_version() -> u32 {
    10
}
fn default_intents() -> u64 {
    513
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_client_name() -> String {
    "chatbridge".to_string()
}
fn default_api_base() -> String {
    "https://api.clickup.com".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_capacity() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            autostart: true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            discovery_url: default_discovery_url(),
            api_version: default_api_version(),
            intents: default_intents(),
            auto_reconnect: true,
            handshake_timeout_secs: default_handshake_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            max_connect_attempts: default_max_connect_attempts(),
            ignore_bots: true,
            client_name: default_client_name(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            workspace_id: String::new(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            persist: true,
            unmapped_policy: UnmappedPolicy::Drop,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `chatbridge.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_string()),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(DEFAULT_CONFIG_FILE.to_string()),
            None => None,
        };

        let mut config = match file {
            Some(p) => {
                let content = std::fs::read_to_string(&p).map_err(|source| ConfigError::Read {
                    path: p.clone(),
                    source,
                })?;
                Self::from_toml_str(&content).map_err(|source| ConfigError::Parse { path: p, source })?
            }
            None => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("CHATBRIDGE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("CHATBRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(token) = std::env::var("CHATBRIDGE_BOT_TOKEN") {
            self.gateway.bot_token = token;
        }
        if let Ok(workspace) = std::env::var("CHATBRIDGE_WORKSPACE_ID") {
            self.forward.workspace_id = workspace;
        }
        if let Ok(dir) = std::env::var("CHATBRIDGE_DATA_DIR") {
            self.server.data_dir = dir;
        }
    }

    /// Resolve a file name inside `server.data_dir`, expanding a leading `~`.
    pub fn data_path(&self, name: &str) -> PathBuf {
        let dir = &self.server.data_dir;
        let base = match dir.strip_prefix("~") {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => std::env::var("HOME")
                .map(|home| PathBuf::from(format!("{home}{rest}")))
                .unwrap_or_else(|_| PathBuf::from(dir)),
            _ => PathBuf::from(dir),
        };
        base.join(name)
    }

    /// `<data_dir>/messages.json`
    pub fn messages_path(&self) -> PathBuf {
        self.data_path("messages.json")
    }

    /// `<data_dir>/token.json`
    pub fn token_path(&self) -> PathBuf {
        self.data_path("token.json")
    }

    /// `<data_dir>/gateway.pid`: present while a gateway session task runs.
    pub fn marker_path(&self) -> PathBuf {
        self.data_path("gateway.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.gateway.intents, 513);
        assert_eq!(config.gateway.api_version, 10);
        assert!(config.gateway.auto_reconnect);
        assert!(config.gateway.ignore_bots);
        assert_eq!(config.store.capacity, 100);
        assert_eq!(config.store.unmapped_policy, UnmappedPolicy::Drop);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn parses_channel_table_and_overrides() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            bot_token = "abc"
            auto_reconnect = false

            [store]
            capacity = 10
            unmapped_policy = "store"

            [channels]
            "1087467843584532510" = "6-901209555432-8"
            "1087466485498265722" = "6-901209555434-8"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.bot_token, "abc");
        assert!(!config.gateway.auto_reconnect);
        assert_eq!(config.gateway.handshake_timeout_secs, 30);
        assert_eq!(config.store.capacity, 10);
        assert_eq!(config.store.unmapped_policy, UnmappedPolicy::Store);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(
            config.channels.get("1087467843584532510").map(String::as_str),
            Some("6-901209555432-8")
        );
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = Config::from_toml_str("[store]\nunmapped_policy = \"forward\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn data_paths_live_under_data_dir() {
        let mut config = Config::default();
        config.server.data_dir = "/tmp/bridge".into();
        assert_eq!(config.messages_path(), PathBuf::from("/tmp/bridge/messages.json"));
        assert_eq!(config.token_path(), PathBuf::from("/tmp/bridge/token.json"));
        assert_eq!(config.marker_path(), PathBuf::from("/tmp/bridge/gateway.pid"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/chatbridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
