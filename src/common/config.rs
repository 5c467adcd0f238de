//! Configuration for minitrans components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator process config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Transaction engine tuning
    #[serde(default)]
    pub trans: TransConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "mnode-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            trans: TransConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `MINITRANS_*`
    /// environment variables (e.g. `MINITRANS_TRANS__MAX_ACTION_ATTEMPTS=4`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("MINITRANS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.trans.validate()?;
        Ok(config)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the admin HTTP API and RPC replies
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for transaction state and metadata logs
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6030))
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./mnode-data")
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
        }
    }
}

/// Transaction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransConfig {
    /// Sends per action before a bounded retry gives up.
    /// Applies to ROLLBACK policy redo actions and to commit actions.
    #[serde(default = "default_max_action_attempts")]
    pub max_action_attempts: u32,

    /// A sent action with no reply after this long is re-sent
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Initial backoff after a transient failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max_ms: u64,

    /// Upper bound on how long the sweeper sleeps with nothing scheduled
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_max_action_attempts() -> u32 {
    8
}
fn default_response_timeout() -> u64 {
    5_000
}
fn default_retry_backoff() -> u64 {
    200
}
fn default_retry_backoff_max() -> u64 {
    10_000
}
fn default_sweep_interval() -> u64 {
    1_000
}

impl Default for TransConfig {
    fn default() -> Self {
        Self {
            max_action_attempts: default_max_action_attempts(),
            response_timeout_ms: default_response_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            retry_backoff_max_ms: default_retry_backoff_max(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl TransConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_action_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_action_attempts must be at least 1".into(),
            ));
        }
        if self.retry_backoff_ms > self.retry_backoff_max_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "retry_backoff_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.retry_backoff_ms, self.retry_backoff_max_ms
            )));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
