use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::transport::Family;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listener: ListenerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub network: Family,
    pub bind: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl ListenerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Socket options for the TCP transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            nodelay: true,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// How long in-flight connections may run after the listener closes
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

// Default values
fn default_heartbeat_ms() -> u64 {
    200
}
fn default_close_grace_ms() -> u64 {
    100
}
fn default_backlog() -> i32 {
    1024
}
fn default_true() -> bool {
    true
}
fn default_protocol() -> String {
    "echo".to_string()
}
fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.heartbeat_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Listener heartbeat_ms must be greater than zero".to_string(),
            ));
        }

        // Only literal addresses are checked here; host names resolve at bind time
        if let Ok(addr) = self.listener.bind.parse::<std::net::SocketAddr>() {
            if !self.listener.network.admits(&addr) {
                return Err(ConfigError::ValidationError(format!(
                    "Listener bind '{}' is not an {} address",
                    self.listener.bind, self.listener.network
                )));
            }
        } else if !self.listener.bind.contains(':') {
            return Err(ConfigError::ValidationError(format!(
                "Listener bind '{}' is missing a port",
                self.listener.bind
            )));
        }

        if self.transport.backlog <= 0 {
            return Err(ConfigError::ValidationError(
                "Transport backlog must be positive".to_string(),
            ));
        }

        if crate::core::protocol::protocol_by_name(&self.server.protocol).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Unknown server protocol '{}'",
                self.server.protocol
            )));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
