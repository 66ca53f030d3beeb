//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Multiplexer settings shared by both sides
    #[serde(default)]
    pub mux: MuxConfig,
    /// Timeout ticker settings
    #[serde(default)]
    pub ticker: TickerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the multiplexer cannot honour
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.mux.channels == 0 || self.mux.channels > crate::channel::MAX_CHANNELS {
            return Err(crate::Error::Config(format!(
                "mux.channels must be within 1..={}, got {}",
                crate::channel::MAX_CHANNELS,
                self.mux.channels
            )));
        }
        if self.ticker.resolution_ms == 0 {
            return Err(crate::Error::Config(
                "ticker.resolution_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            max_connections: 1000,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Connect timeout in seconds
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7400".to_string(),
            connect_timeout: 30,
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Logical channels per physical connection (at most 255)
    pub channels: usize,
    /// Idle read timeout of a virtual channel in milliseconds (0 = none)
    pub read_timeout_ms: u64,
    /// Physical connection I/O timeout in milliseconds (0 = none)
    pub io_timeout_ms: u64,
}

impl MuxConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            channels: crate::channel::MAX_CHANNELS,
            read_timeout_ms: 60_000,
            io_timeout_ms: 0,
        }
    }
}

/// Timeout ticker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    /// Deadline coalescing granularity in milliseconds
    pub resolution_ms: u64,
    /// Capacity of the request inbox
    pub inbox: usize,
}

impl TickerConfig {
    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms.max(1))
    }
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            resolution_ms: 300,
            inbox: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (full, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        ..Default::default()
    }
}
