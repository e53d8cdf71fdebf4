//! Where the registry lives and how often to heartbeat.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("heartbeat_interval_ms must be greater than zero")]
    ZeroInterval,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Registry location and heartbeat cadence. Fixed for the life of a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Registry host
    #[serde(default = "default_host")]
    pub host: String,

    /// Registry port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Time between heartbeats in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 2020 }
fn default_heartbeat_interval_ms() -> u64 { 10_000 }

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Config {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::ZeroInterval);
        }
        Ok(())
    }

    pub fn with_registry(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Intervals under a millisecond, zero included, round up to 1 ms.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `host:port` of the registry.
    pub fn registry_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
