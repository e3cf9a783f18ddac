//! Configuration for the network-server core.
//!
//! Plain serde structs with built-in defaults; a deployment overrides them
//! from a JSON settings file. Durations are integral seconds/milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Complete core configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// PostgreSQL settings (device, profiles, device-queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub dsn: String,
    pub max_open_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dsn: "postgres://localhost/gantry_ns?sslmode=disable".to_string(),
            max_open_connections: 10,
        }
    }
}

/// Redis settings (device-sessions, gateway rx-info).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
        }
    }
}

/// Network-server behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Lifetime of a device-session (and of the devaddr and rx-info keys),
    /// refreshed on every session write. Seconds.
    pub device_session_ttl_secs: u64,
    /// Tick interval of the class-B/C downlink scheduler. Milliseconds.
    pub scheduler_interval_ms: u64,
    /// Window during which uplink copies of the same frame received through
    /// multiple gateways are collected and deduplicated. Milliseconds.
    pub deduplication_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_session_ttl_secs: 31 * 24 * 60 * 60, // 31 days
            scheduler_interval_ms: 1_000,
            deduplication_delay_ms: 200,
        }
    }
}

impl Config {
    /// Load configuration from a JSON settings file.
    pub fn from_file(path: &Path) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Internal(format!("read config {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| StorageError::Internal(format!("parse config {}: {}", path.display(), e)))
    }

    /// Device-session TTL as a `Duration`.
    pub fn device_session_ttl(&self) -> Duration {
        Duration::from_secs(self.network.device_session_ttl_secs)
    }

    /// Scheduler tick interval as a `Duration`.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.network.scheduler_interval_ms)
    }
}
