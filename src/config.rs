//! # Configuration Management
//!
//! Centralized configuration for the transport.
//!
//! Client and server each carry a [`TransportConfig`] with the per-connection
//! knobs (message size limit, socket options, queue limits, timeouts) plus a
//! few side-specific settings.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`MSGPIPE_*`)
//! - Direct instantiation with defaults
//!
//! ## Timeouts
//! Durations are stored in milliseconds. A zero duration disables the
//! corresponding timeout.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Size of the length header that prefixes every frame
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size (16 KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Default send timeout; a peer that stops reading is dropped after this long
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default pending message limit for both send and receive queues
pub const DEFAULT_QUEUE_LIMIT: usize = 10_000;

/// Default first connection id handed out by a server. Id 0 stays reserved
/// for a local host connection.
pub const DEFAULT_FIRST_CONNECTION_ID: u32 = 1;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Transport variables apply to both the client and the server section.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("MSGPIPE_MAX_MESSAGE_SIZE") {
            config.client.transport.max_message_size = val;
            config.server.transport.max_message_size = val;
        }

        if let Some(val) = env_parse::<u64>("MSGPIPE_SEND_TIMEOUT_MS") {
            config.client.transport.send_timeout = Duration::from_millis(val);
            config.server.transport.send_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("MSGPIPE_RECEIVE_TIMEOUT_MS") {
            config.client.transport.receive_timeout = Duration::from_millis(val);
            config.server.transport.receive_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<bool>("MSGPIPE_NO_DELAY") {
            config.client.transport.no_delay = val;
            config.server.transport.no_delay = val;
        }

        if let Some(val) = env_parse::<usize>("MSGPIPE_SEND_QUEUE_LIMIT") {
            config.client.transport.send_queue_limit = val;
            config.server.transport.send_queue_limit = val;
        }

        if let Some(val) = env_parse::<usize>("MSGPIPE_RECEIVE_QUEUE_LIMIT") {
            config.client.transport.receive_queue_limit = val;
            config.server.transport.receive_queue_limit = val;
        }

        if let Some(val) = env_parse::<u64>("MSGPIPE_CONNECT_TIMEOUT_MS") {
            config.client.connect_timeout = Duration::from_millis(val);
        }

        if let Ok(addr) = std::env::var("MSGPIPE_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.server.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Per-connection transport settings shared by client and server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest payload accepted for sending, and largest length header
    /// accepted from a peer
    pub max_message_size: usize,

    /// Disable Nagle's algorithm on every socket
    pub no_delay: bool,

    /// Upper bound for one batched socket write (0 = no timeout)
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Upper bound for waiting on the next frame (0 = no timeout)
    #[serde(with = "duration_serde")]
    pub receive_timeout: Duration,

    /// Pending outgoing messages per connection before it is dropped
    pub send_queue_limit: usize,

    /// Pending incoming messages per connection before it is dropped
    pub receive_queue_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            no_delay: true,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: Duration::ZERO,
            send_queue_limit: DEFAULT_QUEUE_LIMIT,
            receive_queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Send timeout as an option, `None` when disabled
    pub fn send_timeout(&self) -> Option<Duration> {
        non_zero(self.send_timeout)
    }

    /// Receive timeout as an option, `None` when disabled
    pub fn receive_timeout(&self) -> Option<Duration> {
        non_zero(self.receive_timeout)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > u32::MAX as usize {
            errors.push(format!(
                "Max message size {} cannot be represented in a 4-byte header",
                self.max_message_size
            ));
        } else if self.max_message_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_message_size
            ));
        }

        if self.send_queue_limit == 0 {
            errors.push("Send queue limit must be greater than 0".to_string());
        }

        if self.receive_queue_limit == 0 {
            errors.push("Receive queue limit must be greater than 0".to_string());
        }

        if !self.send_timeout.is_zero() && self.send_timeout.as_millis() < 10 {
            errors.push("Send timeout too short (minimum: 10ms, or 0 to disable)".to_string());
        }

        if !self.receive_timeout.is_zero() && self.receive_timeout.as_millis() < 10 {
            errors.push("Receive timeout too short (minimum: 10ms, or 0 to disable)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Connection settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Upper bound for the background connect (0 = operating system default)
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            connect_timeout: Duration::ZERO,
        }
    }
}

impl ClientConfig {
    /// Connect timeout as an option, `None` when disabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero(self.connect_timeout)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .transport
            .validate()
            .into_iter()
            .map(|e| format!("client: {e}"))
            .collect();

        if !self.connect_timeout.is_zero() && self.connect_timeout.as_millis() < 100 {
            errors.push("client: Connect timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }

    /// Validate and return Result, used by `Client::new`
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Connection settings applied to every accepted socket
    #[serde(default)]
    pub transport: TransportConfig,

    /// Interface to listen on (e.g., "0.0.0.0" or "::")
    pub bind_address: String,

    /// First id handed out to an accepted connection; lower ids are reserved
    pub first_connection_id: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            bind_address: String::from("0.0.0.0"),
            first_connection_id: DEFAULT_FIRST_CONNECTION_ID,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .transport
            .validate()
            .into_iter()
            .map(|e| format!("server: {e}"))
            .collect();

        if self.bind_address.is_empty() {
            errors.push("server: Bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "server: Invalid bind address: '{}' (expected an IP such as '0.0.0.0')",
                self.bind_address
            ));
        }

        errors
    }

    /// Validate and return Result, used by `Server::new`
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("msgpipe"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
