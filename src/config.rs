//! Configuration management for gale components.
//!
//! This module provides JSON-based configuration for the server and client
//! drivers, supporting runtime settings like log level, tick rate, timeouts,
//! etc.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error types for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid timeout format: {0}")]
    InvalidTimeout(String),

    #[error("Tick rate must be > 0")]
    InvalidTickRate,

    #[error("Max connections must be > 0")]
    InvalidMaxConnections,

    #[error("Max channels must be > 0")]
    InvalidMaxChannels,
}

/// Helper trait for loading/saving configuration files.
pub trait FileConfig: Serialize + for<'de> Deserialize<'de> + Default + Sized {
    /// Load configuration from a JSON file.
    ///
    /// If the file doesn't exist, returns default config.
    /// If the file exists but is invalid, returns an error.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        // Atomic write: write to temp file first, then rename
        let temp_path = path.as_ref().with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Get the log level as a tracing::Level.
    fn log_level(&self) -> &str;

    /// Get tracing::Level from log_level string.
    fn log_level_as_tracing(&self) -> tracing::Level {
        match self.log_level().to_lowercase().as_str() {
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Driver configuration loaded from JSON file, shared by the server and
/// client demo bins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverFileConfig {
    /// Bind address for the server driver (e.g., "0.0.0.0:7777")
    pub bind_addr: String,

    /// Simulation ticks per second driving queue drain and flush
    pub tick_hz: u32,

    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Channel slots per connection
    pub max_channels: usize,

    /// Inbound-silence timeout before a connection is dropped (e.g., "60s")
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Outbound-silence interval before a keepalive packet (e.g., "5s")
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// Network protocol version exchanged during login
    pub network_version: u32,

    /// Map clients are welcomed into
    pub map_name: String,

    /// Game name sent in the welcome message
    pub game_name: String,

    /// Log level: "debug", "info", "warn", "error"
    pub log_level: String,
}

impl Default for DriverFileConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".to_string(),
            tick_hz: 60,
            max_connections: 128,
            max_channels: 32,
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(5),
            network_version: 1033,
            map_name: "/Game/Maps/Entry".to_string(),
            game_name: "Game".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl FileConfig for DriverFileConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidTickRate);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if self.max_channels == 0 {
            return Err(ConfigError::InvalidMaxChannels);
        }

        // Validate log level
        match self.log_level.to_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log_level.clone())),
        }

        // Validate timeouts are reasonable
        if self.idle_timeout.as_secs() > 600 {
            return Err(ConfigError::InvalidTimeout(
                "idle_timeout too long (max 600s)".to_string(),
            ));
        }
        if self.keepalive_interval >= self.idle_timeout {
            return Err(ConfigError::InvalidTimeout(
                "keepalive_interval must be below idle_timeout".to_string(),
            ));
        }

        Ok(())
    }

    fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Module for Duration serialization/deserialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();
        if secs >= 60 && millis == 0 {
            serializer.serialize_str(&format!("{}s", secs))
        } else if secs >= 1 {
            serializer.serialize_str(&format!("{}.{:03}s", secs, millis))
        } else if millis >= 1 {
            serializer.serialize_str(&format!("{}ms", millis))
        } else {
            serializer.serialize_str("0s")
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if s.ends_with("ms") {
            let num = s[..s.len() - 2].trim();
            let millis: u64 = num
                .parse()
                .map_err(|_| format!("invalid milliseconds: {}", num))?;
            return Ok(Duration::from_millis(millis));
        } else if s.ends_with('s') {
            let num = s[..s.len() - 1].trim();
            if num.contains('.') {
                let parts: Vec<&str> = num.split('.').collect();
                if parts.len() == 2 {
                    let secs: u64 = parts[0]
                        .parse()
                        .map_err(|_| format!("invalid seconds: {}", parts[0]))?;
                    let millis_str = format!("{:0<3}", &parts[1][..3.min(parts[1].len())]);
                    let millis: u32 = millis_str
                        .parse()
                        .map_err(|_| format!("invalid milliseconds: {}", millis_str))?;
                    return Ok(Duration::new(secs, millis * 1_000_000));
                }
            }
            let secs: u64 = num
                .parse()
                .map_err(|_| format!("invalid duration: {}", s))?;
            return Ok(Duration::from_secs(secs));
        } else if s.ends_with('m') {
            let num = s[..s.len() - 1].trim();
            let mins: u64 = num
                .parse()
                .map_err(|_| format!("invalid minutes: {}", num))?;
            return Ok(Duration::from_secs(mins * 60));
        }
        Err(format!("unknown duration format: {}", s))
    }
}
