/// Configuration management for flowgate
///
/// Handles server binding, execution mode selection, log retention, listener
/// expiry and scheduler parameters. Every value has an ENV_VAR override so the
/// same binary runs unchanged in containers.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Local vs remote execution
    pub execution: ExecutionConfig,
    /// In-memory log buffer limits
    pub logs: LogConfig,
    /// Live observer registrations
    pub listeners: ListenerConfig,
    /// Cron scheduler and its worker pool
    pub scheduler: SchedulerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration for schedule persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the schedules database (default: "data")
    /// Creates: {data_dir}/schedules.db
    pub data_dir: String,
}

/// Where compiled programs run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// In-process, through the program registry
    Local,
    /// Delegated to a serverless executor over HTTP
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    /// Base URL of the remote executor (only used in remote mode)
    pub remote_url: String,
    /// Caller-facing timeout for a remote invocation
    pub remote_timeout_secs: u64,
}

impl ExecutionConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// Retention limits of the in-memory log store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Entries older than this are swept
    pub retention_secs: u64,
    /// Per-key cap, oldest entries are dropped first
    pub max_entries_per_key: usize,
    /// Minimum interval between two retention sweeps
    pub sweep_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_entries_per_key: 1000,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// How long an activation stays valid without being renewed
    pub ttl_secs: u64,
}

impl ListenerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of dedicated worker threads executing cron fires
    pub workers: usize,
    /// A fire whose latest due tick is older than this is skipped as a misfire
    pub misfire_grace_secs: u64,
}

impl SchedulerConfig {
    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let execute_local = std::env::var("FLOWGATE_EXECUTE_LOCAL")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWGATE_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWGATE_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            execution: ExecutionConfig {
                mode: if execute_local { ExecutionMode::Local } else { ExecutionMode::Remote },
                remote_url: std::env::var("FLOWGATE_REMOTE_URL")
                    .unwrap_or_else(|_| "http://localhost:9000".to_string()),
                remote_timeout_secs: env_or("FLOWGATE_REMOTE_TIMEOUT_SECS", 910),
            },
            logs: LogConfig {
                retention_secs: env_or("FLOWGATE_LOG_RETENTION_SECS", 3600),
                max_entries_per_key: env_or("FLOWGATE_LOG_MAX_PER_KEY", 1000),
                sweep_interval_secs: 300,
            },
            listeners: ListenerConfig {
                ttl_secs: env_or("FLOWGATE_LISTENER_TTL_SECS", 3600),
            },
            scheduler: SchedulerConfig {
                workers: env_or("FLOWGATE_SCHEDULER_WORKERS", 2),
                misfire_grace_secs: env_or("FLOWGATE_MISFIRE_GRACE_SECS", 300),
            },
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or malformed
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
