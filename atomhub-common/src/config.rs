//! Configuration loading for the atomhub responder
//!
//! Resolution follows the usual priority order: explicit path argument,
//! then the `ATOMHUB_CONFIG` environment variable, then the per-user
//! config directory, then `/etc/atomhub/config.toml`. Individual secrets
//! can be overridden from the environment after the file is loaded so
//! that credentials never have to live on disk.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Storage-system (asset management) connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Object-store download settings
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Base URL that source object keys are resolved against
    pub bucket_endpoint: String,
    /// Local durable directory that media is downloaded into
    pub local_path: PathBuf,
}

/// Import job parameters passed to the storage system
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_shape_tag")]
    pub shape_tag: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_shape_tag() -> String {
    "lowres".to_string()
}

fn default_priority() -> String {
    "HIGH".to_string()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            shape_tag: default_shape_tag(),
            priority: default_priority(),
        }
    }
}

/// Origin system (atom tool) used for resend requests
#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    pub host: String,
    #[serde(default)]
    pub shared_secret: String,
}

/// Retry strategy selection for failed import jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Increment the retry counter and request a resend immediately
    Immediate,
    /// Schedule the resend after min(cap, base^(retry+1)) seconds
    Backoff,
}

/// Retry policy settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    /// Ceiling on import retries before a job is closed as FAILED_TOTAL
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
    /// Backoff cap in seconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u64,
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Immediate
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_base() -> u64 {
    4
}

fn default_backoff_cap() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

/// Broker-facing settings for the dispatch router
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Management API of the broker bridge
    #[serde(default = "default_broker_api")]
    pub api_url: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_broker_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Exchange that outbound notifications are published to
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Ceiling on delivery retries before a message is dead-lettered
    #[serde(default = "default_delivery_retry_limit")]
    pub delivery_retry_limit: u32,
    /// Routing destination for poison messages
    #[serde(default = "default_dead_letter")]
    pub dead_letter_destination: String,
}

fn default_broker_api() -> String {
    "http://localhost:15672/api".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_broker_user() -> String {
    "guest".to_string()
}

fn default_exchange() -> String {
    "atomhub".to_string()
}

fn default_delivery_retry_limit() -> u32 {
    32
}

fn default_dead_letter() -> String {
    "atomhub-dead-letter".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_url: default_broker_api(),
            vhost: default_vhost(),
            username: default_broker_user(),
            password: String::new(),
            exchange: default_exchange(),
            delivery_retry_limit: default_delivery_retry_limit(),
            dead_letter_destination: default_dead_letter(),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Path of the SQLite database file
    pub database_path: PathBuf,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
    #[serde(default = "default_import")]
    pub import: ImportConfig,
    pub origin: OriginConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_import() -> ImportConfig {
    ImportConfig {
        shape_tag: default_shape_tag(),
        priority: default_priority(),
    }
}

impl HubConfig {
    /// Load configuration, resolving the file location in priority order
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(explicit_path)?;
        info!("Loading configuration from {}", path.display());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Secrets may be supplied from the environment instead of the file
    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("ATOMHUB_STORAGE_PASSWORD") {
            self.storage.password = password;
        }
        if let Ok(secret) = std::env::var("ATOMHUB_ORIGIN_SECRET") {
            self.origin.shared_secret = secret;
        }
        if let Ok(password) = std::env::var("ATOMHUB_BROKER_PASSWORD") {
            self.broker.password = password;
        }
    }
}

/// Resolve the configuration file path
///
/// Priority: explicit argument > `ATOMHUB_CONFIG` > per-user config dir >
/// `/etc/atomhub/config.toml`.
fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("ATOMHUB_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    if let Some(dir) = dirs::config_dir() {
        let user_config = dir.join("atomhub").join("config.toml");
        if user_config.exists() {
            return Ok(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/atomhub/config.toml");
    if system_config.exists() {
        return Ok(system_config);
    }

    Err(Error::Config(
        "No config file found; pass --config or set ATOMHUB_CONFIG".to_string(),
    ))
}
