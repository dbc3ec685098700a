//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::websocket::{BuiltinHandler, HubConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubSettings,

    /// Message type → built-in handler installed at startup
    #[serde(default)]
    pub handlers: BTreeMap<String, BuiltinHandler>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on; 0 picks a free port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Hub tuning as it appears in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_queue_capacity")]
    pub command_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_write_timeout() -> u64 {
    5000
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            command_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            command_capacity: settings.command_capacity,
            outbound_capacity: settings.outbound_capacity,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("switchboard").join("config.toml")),
            Some(PathBuf::from("/etc/switchboard/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Hub configuration derived from the `[hub]` section
    pub fn hub_config(&self) -> HubConfig {
        HubConfig::from(&self.hub)
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = var("SWITCHBOARD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("SWITCHBOARD_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        // Hub overrides
        if let Some(ms) = var("SWITCHBOARD_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.hub.write_timeout_ms = ms;
        }
        if let Some(max) = var("SWITCHBOARD_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.hub.max_connections = max;
        }

        // Logging overrides
        if let Some(level) = var("SWITCHBOARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("SWITCHBOARD_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Switchboard Configuration
#
# Environment variables override these settings:
# - SWITCHBOARD_HOST
# - SWITCHBOARD_PORT
# - SWITCHBOARD_WRITE_TIMEOUT_MS
# - SWITCHBOARD_MAX_CONNECTIONS
# - SWITCHBOARD_LOG_LEVEL
# - SWITCHBOARD_LOG_FORMAT

[server]
# Listener host
host = "0.0.0.0"

# Listener port (0 picks a free port)
port = 8080

# How long stop waits for open connections before forcing them closed (ms)
shutdown_timeout_ms = 5000

[hub]
# Connections beyond this are refused
max_connections = 10000

# Queued register/unregister/broadcast requests before senders wait
command_capacity = 256

# Frames queued per connection; a full queue drops the connection
outbound_capacity = 256

# Upper bound for a single socket write (ms)
write_timeout_ms = 5000

[handlers]
# Message type = built-in handler ("echo" or "broadcast").
# Types without a handler are relayed to every connection.
echo = "echo"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
