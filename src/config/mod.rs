//! Configuration management for the fleetward control plane
//!
//! This module handles loading and validating process configuration
//! from environment variables and optional TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend watcher configuration
    pub backend: BackendConfig,

    /// Control protocol fanout configuration
    pub fanout: FanoutConfig,

    /// Job scheduler configuration
    pub jobs: JobsConfig,

    /// Lock coordinator configuration
    pub lock: LockConfig,

    /// Persistent store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Path of the setting catalog (JSON)
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,
}

fn default_schema_path() -> PathBuf {
    PathBuf::from("data/settings.json")
}

/// Backend watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend API (docker engine, swarm manager,
    /// kubernetes apiserver); unused by the static variant
    pub api_url: String,

    /// Poll interval in seconds for backends without push events
    pub poll_interval_secs: u64,

    /// Label/annotation prefix recognized by the watchers
    pub label_prefix: String,

    /// Optional namespace filter; empty means accept everything
    pub namespaces: Vec<String>,

    /// Path of the static variables file (`--variables`)
    pub variables_path: Option<PathBuf>,
}

/// Control protocol fanout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Per-instance request timeout in seconds
    pub request_timeout_secs: u64,

    /// Caller identity sent in the `User-Agent` header
    pub caller_identity: String,

    /// Target virtual host sent in the `Host` header
    pub api_server_name: String,

    /// Default control port when an instance declares none
    pub default_port: u16,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            caller_identity: format!("fleetward/{}", env!("CARGO_PKG_VERSION")),
            api_server_name: String::from("fwapi"),
            default_port: 5000,
        }
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Directory where job artifacts and sidecars are written
    pub cache_dir: PathBuf,

    /// Path of the job catalog (JSON)
    pub catalog_path: PathBuf,

    /// Maximum jobs running in parallel
    pub workers: usize,
}

/// Lock coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Unix socket path for the local control endpoint
    pub socket_path: PathBuf,

    /// Privileged action timeout in seconds
    pub action_timeout_secs: u64,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// How long to wait for the store to become initialized, seconds
    pub init_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("FLEETWARD_BACKEND_URL")
            .unwrap_or_else(|_| String::from("http://localhost:2375"));

        let poll_interval_secs = std::env::var("FLEETWARD_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);

        let label_prefix =
            std::env::var("FLEETWARD_LABEL_PREFIX").unwrap_or_else(|_| String::from("fleetward"));

        let namespaces = std::env::var("FLEETWARD_NAMESPACES")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let request_timeout_secs = std::env::var("FLEETWARD_API_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let api_server_name =
            std::env::var("FLEETWARD_API_SERVER_NAME").unwrap_or_else(|_| String::from("fwapi"));

        let default_port = std::env::var("FLEETWARD_API_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5000);

        let cache_dir = std::env::var("FLEETWARD_CACHE_DIR")
            .unwrap_or_else(|_| String::from("data/cache"))
            .into();

        let catalog_path = std::env::var("FLEETWARD_JOB_CATALOG")
            .unwrap_or_else(|_| String::from("data/jobs.json"))
            .into();

        let workers = std::env::var("FLEETWARD_JOB_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);

        let socket_path = std::env::var("FLEETWARD_LOCK_SOCKET")
            .unwrap_or_else(|_| String::from("/var/run/fleetward/lock.sock"))
            .into();

        let action_timeout_secs = std::env::var("FLEETWARD_ACTION_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let sqlite_path = std::env::var("FLEETWARD_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/fleetward.db"))
            .into();

        let init_timeout_secs = std::env::var("FLEETWARD_STORE_INIT_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(120);

        let log_level =
            std::env::var("FLEETWARD_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format =
            std::env::var("FLEETWARD_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        let schema_path = std::env::var("FLEETWARD_SCHEMA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_schema_path());

        Ok(Self {
            backend: BackendConfig {
                api_url,
                poll_interval_secs,
                label_prefix,
                namespaces,
                variables_path: None,
            },
            fanout: FanoutConfig {
                request_timeout_secs,
                caller_identity: format!("fleetward/{}", env!("CARGO_PKG_VERSION")),
                api_server_name,
                default_port,
            },
            jobs: JobsConfig {
                cache_dir,
                catalog_path,
                workers,
            },
            lock: LockConfig {
                socket_path,
                action_timeout_secs,
            },
            store: StoreConfig {
                sqlite_path,
                init_timeout_secs,
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
            schema_path,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.backend.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }

        if self.fanout.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }

        if self.jobs.workers == 0 {
            anyhow::bail!("jobs.workers must be greater than 0");
        }

        if self.backend.label_prefix.is_empty() {
            anyhow::bail!("label_prefix cannot be empty");
        }

        Ok(())
    }

    /// Get fanout request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fanout.request_timeout_secs)
    }

    /// Get backend poll interval as Duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.backend.poll_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                api_url: String::from("http://localhost:2375"),
                poll_interval_secs: 10,
                label_prefix: String::from("fleetward"),
                namespaces: Vec::new(),
                variables_path: None,
            },
            fanout: FanoutConfig::default(),
            jobs: JobsConfig {
                cache_dir: PathBuf::from("data/cache"),
                catalog_path: PathBuf::from("data/jobs.json"),
                workers: 4,
            },
            lock: LockConfig {
                socket_path: PathBuf::from("/var/run/fleetward/lock.sock"),
                action_timeout_secs: 60,
            },
            store: StoreConfig {
                sqlite_path: PathBuf::from("data/fleetward.db"),
                init_timeout_secs: 120,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
            schema_path: default_schema_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_poll_interval() {
        let mut config = Config::default();
        config.backend.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_workers() {
        let mut config = Config::default();
        config.jobs.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout_conversion() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }
}
