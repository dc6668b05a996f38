//! Service configuration, loaded from TOML.
//!
//! ```toml
//! listeners = ["127.0.0.1:46200"]
//! retry_intervals = ["10s", "1m", "00:05:00"]
//! cancel_match = "exact"
//!
//! [[authorization]]
//! url_prefix = "http://app.example.com/"
//! allowed_from = ["10.0.0.0/8"]
//! retry_count = 3
//!
//! [persistence]
//! provider = "sqlite"
//! connection_string = "callbacks.db"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::authorization::{AuthorizationTable, DuplicatePrefix};
use crate::dispatcher::DispatcherConfig;
use crate::network::IpNetwork;
use crate::state::CancelMatch;
use crate::storage::{InMemoryStore, NullStore, TaskStore};
use crate::types::{AuthorizationPolicy, MAX_RETRY_COUNT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("retry_intervals must not be empty")]
    EmptyRetryIntervals,

    #[error("retry_intervals must be ascending")]
    RetryIntervalsNotAscending,

    #[error("retry_count {value} for {prefix} exceeds 100")]
    RetryCountOutOfRange { prefix: String, value: u32 },

    #[error("at least one listener is required")]
    NoListeners,

    #[error("unknown persistence provider: {0:?}")]
    UnknownProvider(String),

    #[error("persistence provider {0:?} requires a connection_string")]
    MissingConnectionString(String),

    #[error(transparent)]
    DuplicatePrefix(#[from] DuplicatePrefix),
}

/// Response timing for refused schedule and cancel requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnauthorizedDelay {
    /// Sleep a random 0-510ms before answering.
    #[default]
    Random,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listeners")]
    pub listeners: Vec<SocketAddr>,
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals: Vec<String>,
    #[serde(default)]
    pub authorization: Vec<AuthorizationRule>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub cancel_match: CancelMatch,
    #[serde(default)]
    pub unauthorized_delay: UnauthorizedDelay,
}

fn default_listeners() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([127, 0, 0, 1], 46200))]
}

fn default_retry_intervals() -> Vec<String> {
    ["10s", "1m", "5m", "30m", "1h", "4h"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            retry_intervals: default_retry_intervals(),
            authorization: Vec::new(),
            persistence: PersistenceConfig::default(),
            dispatch: DispatchSettings::default(),
            cancel_match: CancelMatch::default(),
            unauthorized_delay: UnauthorizedDelay::default(),
        }
    }
}

/// One `[[authorization]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationRule {
    pub url_prefix: String,
    #[serde(default)]
    pub allowed_from: Vec<IpNetwork>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_provider() -> String { "none".into() }
fn default_pool_size() -> usize { 4 }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            connection_string: None,
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
    #[serde(default = "default_overload_backoff")]
    pub overload_backoff: String,
}

fn default_request_timeout() -> String { "30s".into() }
fn default_shutdown_grace() -> String { "5s".into() }
fn default_overload_backoff() -> String { "1s".into() }

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_count: None,
            request_timeout: default_request_timeout(),
            shutdown_grace: default_shutdown_grace(),
            overload_backoff: default_overload_backoff(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate config from a file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        self.retry_intervals()?;
        self.dispatcher_config()?;
        for rule in &self.authorization {
            if rule.retry_count > MAX_RETRY_COUNT {
                return Err(ConfigError::RetryCountOutOfRange {
                    prefix: rule.url_prefix.clone(),
                    value: rule.retry_count,
                });
            }
        }
        self.authorization_table()?;
        self.persistence.check()?;
        Ok(())
    }

    pub fn retry_intervals(&self) -> Result<Vec<Duration>, ConfigError> {
        if self.retry_intervals.is_empty() {
            return Err(ConfigError::EmptyRetryIntervals);
        }
        let intervals = self
            .retry_intervals
            .iter()
            .map(|s| parse_duration(s))
            .collect::<Result<Vec<_>, _>>()?;
        if intervals.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::RetryIntervalsNotAscending);
        }
        Ok(intervals)
    }

    pub fn authorization_table(&self) -> Result<AuthorizationTable, ConfigError> {
        let table = AuthorizationTable::from_policies(self.authorization.iter().map(|rule| {
            let mut policy = AuthorizationPolicy::new(rule.url_prefix.clone())
                .with_retry_count(rule.retry_count);
            policy.allowed_from = rule.allowed_from.clone();
            policy
        }))?;
        Ok(table)
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig, ConfigError> {
        let defaults = DispatcherConfig::default();
        Ok(DispatcherConfig {
            worker_count: self.dispatch.worker_count.unwrap_or(defaults.worker_count).max(1),
            request_timeout: parse_duration(&self.dispatch.request_timeout)?,
            shutdown_grace: parse_duration(&self.dispatch.shutdown_grace)?,
            overload_backoff: parse_duration(&self.dispatch.overload_backoff)?,
        })
    }

    pub fn build_store(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        self.persistence.build_store()
    }
}

impl PersistenceConfig {
    fn check(&self) -> Result<(), ConfigError> {
        match self.provider.to_ascii_lowercase().as_str() {
            "" | "none" | "memory" => Ok(()),
            "sqlite" if cfg!(feature = "sqlite") => match self.connection_string.as_deref() {
                Some(cs) if !cs.trim().is_empty() => Ok(()),
                _ => Err(ConfigError::MissingConnectionString(self.provider.clone())),
            },
            _ => Err(ConfigError::UnknownProvider(self.provider.clone())),
        }
    }

    pub fn build_store(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        self.check()?;
        match self.provider.to_ascii_lowercase().as_str() {
            "memory" => Ok(Arc::new(InMemoryStore::new())),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let cs = self.connection_string.as_deref().unwrap_or_default();
                Ok(Arc::new(
                    crate::storage_sqlite::SqliteStore::from_connection_string(cs)
                        .with_pool_size(self.pool_size),
                ))
            }
            _ => Ok(Arc::new(NullStore::new())),
        }
    }
}

/// Parse `500ms`, `10s`, `5m`, `1h`, `1d`, or `hh:mm:ss`.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let s = text.trim();

    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return Err(invalid());
        };
        let h: u64 = h.parse().map_err(|_| invalid())?;
        let m: u64 = m.parse().map_err(|_| invalid())?;
        let sec: u64 = sec.parse().map_err(|_| invalid())?;
        if m >= 60 || sec >= 60 {
            return Err(invalid());
        }
        let secs = h
            .checked_mul(3600)
            .and_then(|hs| hs.checked_add(m * 60 + sec))
            .ok_or_else(invalid)?;
        return Ok(Duration::from_secs(secs));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    let secs = value.checked_mul(scale).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}
