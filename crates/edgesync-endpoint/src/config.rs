//! Endpoint configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::persistence::Category;

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Endpoint identity, the root of every topic
    pub endpoint_id: String,

    /// Broker URL (`tcp://host:port`, `mqtt://host:port` or `host[:port]`)
    pub host_uri: String,

    /// Time allowed for one connect attempt
    pub connect_timeout: Duration,

    /// Pause between connect attempts; zero makes disconnection terminal
    pub retry_interval: Duration,

    /// MQTT keep-alive
    pub keep_alive: Duration,

    /// Start with a clean MQTT session
    pub clean_session: bool,

    /// Maximum unacknowledged outgoing publishes
    pub max_inflight: u16,

    /// Primary message format: "json" or "cbor"
    pub message_format: String,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Folder holding executable jobs
    pub jobs_folder: PathBuf,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store type: "sqlite", "memory" or "none"
    pub store_type: String,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,

    /// Per-category queue limits
    pub limits: CategoryLimits,
}

/// Maximum number of queued messages per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryLimits {
    /// Attribute updates, acknowledgements and transactions
    pub update: usize,
    /// Log records
    pub log: usize,
    /// Node added / removed events
    pub lifecycle: usize,
}

impl CategoryLimits {
    /// Limit for `category`.
    #[must_use]
    pub fn limit(&self, category: Category) -> usize {
        match category {
            Category::Update => self.update,
            Category::Log => self.log,
            Category::Lifecycle => self.lifecycle,
        }
    }
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            update: 10_000,
            log: 10_000,
            lifecycle: 1_000,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            endpoint_id: "edgesync".to_string(),
            host_uri: "tcp://localhost:1883".to_string(),
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            clean_session: false,
            max_inflight: 1000,
            message_format: "json".to_string(),
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./edgesync.db"),
                limits: CategoryLimits::default(),
            },
            jobs_folder: PathBuf::from("./jobs"),
        }
    }
}

impl EndpointConfig {
    /// Default configuration for the endpoint `endpoint_id`.
    #[must_use]
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EDGESYNC_ENDPOINT_ID`: Endpoint identity
    /// - `EDGESYNC_HOST_URI`: Broker URL
    /// - `EDGESYNC_CONNECT_TIMEOUT`: Connect timeout in seconds
    /// - `EDGESYNC_RETRY_INTERVAL`: Retry interval in seconds, 0 disables retry
    /// - `EDGESYNC_KEEP_ALIVE`: Keep-alive in seconds
    /// - `EDGESYNC_CLEAN_SESSION`: "true" or "false"
    /// - `EDGESYNC_MAX_INFLIGHT`: Maximum in-flight publishes
    /// - `EDGESYNC_MESSAGE_FORMAT`: "json" or "cbor"
    /// - `EDGESYNC_PERSISTENCE`: "sqlite", "memory" or "none"
    /// - `EDGESYNC_DB_PATH`: `SQLite` database path
    /// - `EDGESYNC_UPDATE_LIMIT`, `EDGESYNC_LOG_LIMIT`, `EDGESYNC_LIFECYCLE_LIMIT`:
    ///   per-category queue limits
    /// - `EDGESYNC_JOBS_FOLDER`: Folder holding executable jobs
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("EDGESYNC_ENDPOINT_ID") {
            config.endpoint_id = id;
        }

        if let Ok(uri) = std::env::var("EDGESYNC_HOST_URI") {
            config.host_uri = uri;
        }

        if let Some(secs) = env_parse::<u64>("EDGESYNC_CONNECT_TIMEOUT")? {
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("EDGESYNC_RETRY_INTERVAL")? {
            config.retry_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("EDGESYNC_KEEP_ALIVE")? {
            config.keep_alive = Duration::from_secs(secs);
        }

        if let Some(clean) = env_parse::<bool>("EDGESYNC_CLEAN_SESSION")? {
            config.clean_session = clean;
        }

        if let Some(inflight) = env_parse::<u16>("EDGESYNC_MAX_INFLIGHT")? {
            config.max_inflight = inflight;
        }

        if let Ok(format) = std::env::var("EDGESYNC_MESSAGE_FORMAT") {
            config.message_format = format;
        }

        if let Ok(store_type) = std::env::var("EDGESYNC_PERSISTENCE") {
            config.persistence.store_type = store_type;
        }

        if let Ok(db_path) = std::env::var("EDGESYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(limit) = env_parse("EDGESYNC_UPDATE_LIMIT")? {
            config.persistence.limits.update = limit;
        }

        if let Some(limit) = env_parse("EDGESYNC_LOG_LIMIT")? {
            config.persistence.limits.log = limit;
        }

        if let Some(limit) = env_parse("EDGESYNC_LIFECYCLE_LIMIT")? {
            config.persistence.limits.lifecycle = limit;
        }

        if let Ok(folder) = std::env::var("EDGESYNC_JOBS_FOLDER") {
            config.jobs_folder = PathBuf::from(folder);
        }

        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {name}: {raw}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EndpointConfig::new("dev1");
        assert_eq!(config.endpoint_id, "dev1");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert!(!config.clean_session);
        assert_eq!(config.persistence.limits.limit(Category::Lifecycle), 1_000);
        assert_eq!(config.persistence.limits.limit(Category::Update), 10_000);
    }

    #[test]
    fn env_parse_reports_variable() {
        std::env::set_var("EDGESYNC_TEST_BAD_NUMBER", "ten");
        let err = env_parse::<u64>("EDGESYNC_TEST_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("EDGESYNC_TEST_BAD_NUMBER"));
        assert!(env_parse::<u64>("EDGESYNC_TEST_UNSET_VARIABLE").unwrap().is_none());
    }
}
