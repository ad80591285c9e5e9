use std::{env, fmt, path::Path, path::PathBuf};

use async_trait::async_trait;
use channel_plugin::ChannelId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::logger::LogConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("config store unavailable: {0}")]
    Unavailable(String),
}

/// Who a stored value belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageScope {
    Agent,
    Extension(ChannelId),
}

impl StorageScope {
    pub fn label(&self) -> String {
        match self {
            StorageScope::Agent => "agent".to_string(),
            StorageScope::Extension(id) => format!("ext:{id}"),
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub secret: bool,
}

impl ConfigField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: None,
            secret: false,
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Scoped key/value configuration consumed by the runtime (e.g. long-poll cursors).
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Stored value, or the field's default.
    async fn get(&self, scope: &StorageScope, field: &ConfigField) -> Result<Option<String>, ConfigError>;

    async fn set(&self, scope: &StorageScope, field: &ConfigField, value: &str) -> Result<(), ConfigError>;

    async fn delete(&self, scope: &StorageScope, field: &ConfigField) -> Result<(), ConfigError>;

    /// Latest-value stream of the stored value (without defaults); replays the current value.
    fn observe(&self, scope: &StorageScope, field: &ConfigField) -> watch::Receiver<Option<String>>;

    async fn get_all(&self, scope: &StorageScope) -> Result<Vec<(String, String)>, ConfigError>;

    async fn delete_all(&self, scope: &StorageScope) -> Result<(), ConfigError>;
}

/// In-memory store; every key owns a watch channel so observers see updates.
#[derive(Default)]
pub struct MapConfigStore {
    values: DashMap<(String, String), watch::Sender<Option<String>>>,
}

impl MapConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: &StorageScope, field: &ConfigField) -> (String, String) {
        (scope.label(), field.name.clone())
    }
}

impl fmt::Debug for MapConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapConfigStore").field("keys", &self.values.len()).finish()
    }
}

#[async_trait]
impl ConfigStore for MapConfigStore {
    async fn get(&self, scope: &StorageScope, field: &ConfigField) -> Result<Option<String>, ConfigError> {
        let stored = self
            .values
            .get(&Self::key(scope, field))
            .and_then(|tx| tx.borrow().clone());
        Ok(stored.or_else(|| field.default_value.clone()))
    }

    async fn set(&self, scope: &StorageScope, field: &ConfigField, value: &str) -> Result<(), ConfigError> {
        self.values
            .entry(Self::key(scope, field))
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, scope: &StorageScope, field: &ConfigField) -> Result<(), ConfigError> {
        if let Some(tx) = self.values.get(&Self::key(scope, field)) {
            tx.send_replace(None);
        }
        Ok(())
    }

    fn observe(&self, scope: &StorageScope, field: &ConfigField) -> watch::Receiver<Option<String>> {
        self.values
            .entry(Self::key(scope, field))
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    async fn get_all(&self, scope: &StorageScope) -> Result<Vec<(String, String)>, ConfigError> {
        let label = scope.label();
        let mut all: Vec<(String, String)> = self
            .values
            .iter()
            .filter(|e| e.key().0 == label)
            .filter_map(|e| e.value().borrow().clone().map(|v| (e.key().1.clone(), v)))
            .collect();
        all.sort();
        Ok(all)
    }

    async fn delete_all(&self, scope: &StorageScope) -> Result<(), ConfigError> {
        let label = scope.label();
        for entry in self.values.iter().filter(|e| e.key().0 == label) {
            entry.value().send_replace(None);
        }
        Ok(())
    }
}

pub const ENV_LOG_LEVEL: &str = "CHANNEL_HOST_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "CHANNEL_HOST_LOG_DIR";
pub const ENV_OTEL_ENDPOINT: &str = "CHANNEL_HOST_OTEL_ENDPOINT";
pub const ENV_QUEUE_CAPACITY: &str = "CHANNEL_HOST_QUEUE_CAPACITY";
pub const ENV_HTTP_TIMEOUT_MS: &str = "CHANNEL_HOST_HTTP_TIMEOUT_MS";

/// Where the settings came from, kept so it can be logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvFileSource {
    #[default]
    NotRequested,
    Loaded(PathBuf),
    Missing(PathBuf),
}

/// Process-level runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub queue_capacity: usize,
    pub http_timeout_ms: u64,
    #[serde(skip)]
    pub env_file: EnvFileSource,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_dir: None,
            otel_endpoint: None,
            queue_capacity: 100,
            http_timeout_ms: 30_000,
            env_file: EnvFileSource::NotRequested,
        }
    }
}

impl HostConfig {
    /// Loads `env_file` (if it exists) into the environment, then reads the settings.
    /// Runs before tracing is installed, so nothing is logged here; see [`Self::log_env_file`].
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let source = match env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).map_err(|e| ConfigError::Unavailable(e.to_string()))?;
                EnvFileSource::Loaded(path.to_path_buf())
            }
            Some(path) => EnvFileSource::Missing(path.to_path_buf()),
            None => EnvFileSource::NotRequested,
        };
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        config.env_file = source;
        Ok(config)
    }

    pub fn log_env_file(&self) {
        match &self.env_file {
            EnvFileSource::Loaded(path) => info!("Loaded .env from {}", path.display()),
            EnvFileSource::Missing(path) => warn!("no .env at {}, using process environment", path.display()),
            EnvFileSource::NotRequested => {}
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_level.clone(), self.log_dir.clone(), self.otel_endpoint.clone())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let queue_capacity = match non_blank(ENV_QUEUE_CAPACITY) {
            Some(raw) => parse_positive(ENV_QUEUE_CAPACITY, &raw)?,
            None => defaults.queue_capacity,
        };
        let http_timeout_ms = match non_blank(ENV_HTTP_TIMEOUT_MS) {
            Some(raw) => parse_positive(ENV_HTTP_TIMEOUT_MS, &raw)? as u64,
            None => defaults.http_timeout_ms,
        };

        Ok(Self {
            log_level: non_blank(ENV_LOG_LEVEL).unwrap_or(defaults.log_level),
            log_dir: non_blank(ENV_LOG_DIR).map(PathBuf::from),
            otel_endpoint: non_blank(ENV_OTEL_ENDPOINT),
            queue_capacity,
            http_timeout_ms,
            env_file: EnvFileSource::NotRequested,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::Invalid {
            key: key.into(),
            reason: "must be positive".into(),
        }),
        Ok(v) => Ok(v),
        Err(e) => Err(ConfigError::Invalid {
            key: key.into(),
            reason: e.to_string(),
        }),
    }
}
