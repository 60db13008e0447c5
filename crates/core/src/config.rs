//! Runtime configuration
//!
//! `RuntimeConfig` gathers every tunable of the core in one serde document:
//! limits, cache policy, monitor thresholds, scheduler and batch settings,
//! the per-tick drain budget and bulk creation sizing. It is read from a JSON
//! file and then overridden by environment variables:
//!
//! - `TILEBAY_MAX_OBJECTS`: object limit (0 disables it)
//! - `TILEBAY_MAX_MEMORY_MB`: memory budget in MB
//! - `TILEBAY_MAX_WORKERS`: concurrent background workers
//! - `TILEBAY_CACHE_POLICY`: `lru`, `lfu`, `adaptive` or `ttl:<millis>`

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tilebay_cache::{EvictionPolicy, LimitsError, MonitorConfig, ResourceLimits};
use tilebay_scheduler::{BatchTrigger, SchedulerConfig};
use tracing::debug;

use crate::creation::CreationOptions;

pub const ENV_MAX_OBJECTS: &str = "TILEBAY_MAX_OBJECTS";
pub const ENV_MAX_MEMORY_MB: &str = "TILEBAY_MAX_MEMORY_MB";
pub const ENV_MAX_WORKERS: &str = "TILEBAY_MAX_WORKERS";
pub const ENV_CACHE_POLICY: &str = "TILEBAY_CACHE_POLICY";

const CONFIG_FILE: &str = "runtime.json";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Limits(#[from] LimitsError),

    #[error("monitor thresholds must satisfy 0 < warning <= critical <= 1")]
    InvalidMonitor,

    #[error("unable to resolve the platform config directory")]
    NoConfigDirectory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Per-tick drain budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub max_items: usize,
    pub max_duration_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_items: 64,
            max_duration_ms: 8,
        }
    }
}

impl DrainConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Everything the runtime needs to start
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub limits: ResourceLimits,
    pub cache_policy: EvictionPolicy,
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    pub batch: BatchTrigger,
    pub drain: DrainConfig,
    pub creation: CreationOptions,
    /// Age after which aggressive cleanup cancels a worker. `None` uses the
    /// registry default.
    pub worker_grace_ms: Option<u64>,
}

impl RuntimeConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_parse::<usize>(ENV_MAX_OBJECTS)? {
            self.limits = self.limits.with_max_objects(value);
        }
        if let Some(value) = env_parse::<usize>(ENV_MAX_MEMORY_MB)? {
            self.limits = self.limits.with_max_memory_mb(value);
        }
        if let Some(value) = env_parse::<usize>(ENV_MAX_WORKERS)? {
            self.limits = self.limits.with_max_concurrent_workers(value);
        }
        if let Some(value) = env_parse::<EvictionPolicy>(ENV_CACHE_POLICY)? {
            self.cache_policy = value;
        }
        self.validate()
    }

    /// Load the file at `path` if it exists, then apply the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            debug!(path = %path.display(), "loading runtime config");
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// `<platform config dir>/tilebay/runtime.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDirectory)?;
        Ok(base.join("tilebay").join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if !self.monitor.is_valid() {
            return Err(ConfigError::InvalidMonitor);
        }
        if self.cache_policy.max_age() == Some(Duration::ZERO) {
            return Err(invalid("cache_policy", self.cache_policy));
        }
        if self.scheduler.max_queue_depth == 0 {
            return Err(invalid("scheduler.max_queue_depth", 0));
        }
        if self.drain.max_items == 0 {
            return Err(invalid("drain.max_items", 0));
        }
        if self.creation.baseline_chunk == 0 {
            return Err(invalid("creation.baseline_chunk", 0));
        }
        if self.creation.min_chunk > self.creation.baseline_chunk {
            return Err(invalid("creation.min_chunk", self.creation.min_chunk));
        }
        Ok(())
    }

    pub fn worker_grace(&self) -> Option<Duration> {
        self.worker_grace_ms.map(Duration::from_millis)
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
        Err(_) => Ok(None),
    }
}
