//! Configuration for the Lattice responder.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LATTICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lattice/config.toml
//!   3. ~/.config/lattice/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Number of query executor workers. 0 = the default pool size.
    pub worker_count: usize,

    /// Fairness thaw interval in milliseconds. Peers frozen after finishing
    /// a batch are reinstated on this cadence.
    pub thaw_interval_ms: u64,

    /// Capacity of the serializer's inbound message channel.
    pub message_channel_capacity: usize,

    /// Minimum accumulated work a queue pop aims for.
    pub target_work_per_pop: u64,
}

/// Default executor pool size.
pub const DEFAULT_WORKER_COUNT: usize = 6;

/// Default thaw interval.
pub const DEFAULT_THAW_INTERVAL: Duration = Duration::from_millis(100);

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            thaw_interval_ms: DEFAULT_THAW_INTERVAL.as_millis() as u64,
            message_channel_capacity: 16,
            target_work_per_pop: 1,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ResponderConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ResponderConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LATTICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Effective worker count — 0 in the file means "use the default".
    pub fn workers(&self) -> usize {
        if self.worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            self.worker_count
        }
    }

    pub fn thaw_interval(&self) -> Duration {
        Duration::from_millis(self.thaw_interval_ms.max(1))
    }

    /// Apply LATTICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LATTICE_RESPONDER__WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("LATTICE_RESPONDER__THAW_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.thaw_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("LATTICE_RESPONDER__MESSAGE_CHANNEL_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.message_channel_capacity = n;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lattice")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ResponderConfig::default();
        assert_eq!(config.workers(), DEFAULT_WORKER_COUNT);
        assert_eq!(config.thaw_interval(), DEFAULT_THAW_INTERVAL);
        assert_eq!(config.message_channel_capacity, 16);
    }

    #[test]
    fn zero_worker_count_falls_back_to_default() {
        let config = ResponderConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert_eq!(config.workers(), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn thaw_interval_never_zero() {
        let config = ResponderConfig {
            thaw_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.thaw_interval() >= Duration::from_millis(1));
    }

    #[test]
    fn parses_partial_toml() {
        let config: ResponderConfig = toml::from_str("worker_count = 2").unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.thaw_interval_ms, 100);
    }
}
