//! Configuration for minishard components
//!
//! Sources, lowest priority first: built-in defaults, the TOML file named by
//! `$MINISHARD_CONFIG` (or `./minishard.toml`), then `MINISHARD__*` environment
//! variables. The binaries apply CLI flags on top.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_ENV: &str = "MINISHARD_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "minishard.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path.as_path()).required(false))
            .add_source(::config::Environment::with_prefix("MINISHARD").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        self.coordinator.retry.validate()
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for the catalog
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Shard id -> base URL, used for routing refresh notifications
    #[serde(default)]
    pub shard_urls: HashMap<String, String>,

    /// Backoff for transient store failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-shard timeout for a refresh notification
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_ms: u64,

    /// How long a finished operation record is kept before the sweep removes it
    #[serde(default = "default_gc_expiry")]
    pub gc_expiry_secs: u64,

    /// Interval between garbage sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./minishard-data")
}
fn default_notify_timeout() -> u64 {
    5_000
}
fn default_gc_expiry() -> u64 {
    7 * 24 * 3600
}
fn default_sweep_interval() -> u64 {
    60
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            shard_urls: HashMap::new(),
            retry: RetryConfig::default(),
            notify_timeout_ms: default_notify_timeout(),
            gc_expiry_secs: default_gc_expiry(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CoordinatorConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn gc_expiry(&self) -> Duration {
        Duration::from_secs(self.gc_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Exponential backoff bounds for durable writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_initial_delay() -> u64 {
    50
}
fn default_max_delay() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 || self.max_delay_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "retry delays must be non-zero".into(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "retry initial delay {}ms exceeds max delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}
