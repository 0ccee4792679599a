//! # Configuration Management
//!
//! Centralized configuration for sessions, the listener and outbound clients.
//!
//! This module provides structured configuration for session timing
//! (tick rate, keepalive, shutdown grace), listener binding, client reconnect
//! policy and logging output.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - The fixed IV and salt are shared by every session using the same password.
//!   Identical plaintext prefixes produce identical ciphertext prefixes. They are
//!   kept only so peers stay wire compatible.

use crate::error::{SessionError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current frame version written into every default-framed packet
pub const FRAME_VERSION: u8 = 1;

/// Magic bytes identifying a default-framed packet ("SFPK")
pub const MAGIC_BYTES: [u8; 4] = [0x53, 0x46, 0x50, 0x4B];

/// Max allowed payload size for one framed packet (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default port for generic listeners
pub const DEFAULT_PORT: u16 = 14001;

/// Default port of the example server and of outbound clients
pub const DEFAULT_SERVER_PORT: u16 = 12859;

/// Segment size used when copying stream payloads
pub const BUFFER_SEGMENT_SIZE: usize = 64 * 1024;

/// Salt appended to passwords before hashing
pub const KEY_SALT: &str = "aog827a71e3if5TT9e";

/// Initialization vector shared by every session using the same password
pub const FIXED_IV: [u8; 16] = [
    1, 26, 103, 66, 166, 3, 241, 199, 65, 60, 170, 186, 114, 222, 44, 132,
];

/// Default tick rate of the per-session scheduler
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// The scheduler never ticks faster than this
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Disconnect when nothing was received for this long
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Send a ping at most this often while idle
pub const PING_INTERVAL: Duration = Duration::from_secs(3);

/// How long `stop` waits for the shutdown notice to flush
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Backoff used for "try again shortly"
pub const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Minimum delay between client reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FactoryConfig {
    /// Per-session timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FactoryConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| SessionError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| SessionError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| SessionError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SOCKET_FACTORY_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(port) = std::env::var("SOCKET_FACTORY_SERVER_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.server.port = val;
            }
        }

        if let Ok(addr) = std::env::var("SOCKET_FACTORY_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(port) = std::env::var("SOCKET_FACTORY_CLIENT_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.client.port = val;
            }
        }

        if let Ok(password) = std::env::var("SOCKET_FACTORY_CLIENT_PASSWORD") {
            config.client.password = password;
        }

        if let Ok(tick) = std::env::var("SOCKET_FACTORY_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.session.tick_interval = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("SOCKET_FACTORY_KEEPALIVE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.keepalive_timeout = Duration::from_millis(val);
            }
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
            .map_err(|e| SessionError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| SessionError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SessionError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Timing shared by every session
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// How often the scheduler runs the session tick
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Force a disconnect after this long without inbound packets
    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,

    /// Interval between keepalive pings
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Grace window `stop` gives the shutdown notice
    #[serde(with = "duration_serde")]
    pub stop_grace_period: Duration,

    /// Short backoff between retried send/receive passes
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            stop_grace_period: STOP_GRACE_PERIOD,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

impl SessionConfig {
    /// Validate session timing
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval < MIN_TICK_INTERVAL {
            errors.push(format!(
                "Tick interval too short (minimum: {}ms)",
                MIN_TICK_INTERVAL.as_millis()
            ));
        }

        if self.ping_interval.is_zero() {
            errors.push("Ping interval must be greater than 0".to_string());
        }

        if self.keepalive_timeout <= self.ping_interval {
            errors.push("Keepalive timeout must be longer than the ping interval".to_string());
        }

        if self.stop_grace_period.as_secs() > 60 {
            errors.push("Stop grace period too long (maximum: 60s)".to_string());
        }

        if self.retry_backoff.is_zero() {
            errors.push("Retry backoff must be greater than 0".to_string());
        } else if self.retry_backoff.as_secs() > 1 {
            errors.push("Retry backoff too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Local address to bind (e.g., "0.0.0.0")
    pub address: String,

    /// Local port to bind
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0"),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl ServerConfig {
    /// Full socket address string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected an IP such as '0.0.0.0')",
                self.address
            ));
        }

        errors
    }
}

/// Outbound client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server IP
    pub address: String,

    /// Target server port
    pub port: u16,

    /// Password used to derive the session key (blank disables encryption)
    #[serde(default)]
    pub password: String,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1"),
            port: DEFAULT_SERVER_PORT,
            password: String::new(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

impl ClientConfig {
    /// Full socket address string of the target server
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected an IP such as '127.0.0.1')",
                self.address
            ));
        }

        if self.port == 0 {
            errors.push("Client port cannot be 0".to_string());
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 3600 {
            errors.push("Reconnect delay too long (maximum: 1 hour)".to_string());
        }

        errors
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("socket-factory"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
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
