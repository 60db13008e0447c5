//! Resource limits and eviction policy selection.
//!
//! Limits are plain `Copy` values. Components never mutate a limits value in
//! place; changing policy means building a new `ResourceLimits` and handing it
//! to `set_limits` on the cache or registry.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bytes in one megabyte.
pub const MB: usize = 1024 * 1024;

/// Budget shared by the cache store, the resource registry and the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of live objects (cache entries or registered handles).
    /// Zero disables the count limit.
    pub max_objects: usize,
    /// Memory budget in megabytes
    pub max_memory_mb: usize,
    /// Maximum number of concurrently admitted background workers
    pub max_concurrent_workers: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_objects: 5_000,
            max_memory_mb: 512,
            max_concurrent_workers: 4,
        }
    }
}

impl ResourceLimits {
    /// Create a new set of limits.
    pub fn new(max_objects: usize, max_memory_mb: usize, max_concurrent_workers: usize) -> Self {
        Self {
            max_objects,
            max_memory_mb,
            max_concurrent_workers,
        }
    }

    /// Copy of these limits with a different object limit.
    pub fn with_max_objects(self, max_objects: usize) -> Self {
        Self {
            max_objects,
            ..self
        }
    }

    /// Copy of these limits with a different memory budget.
    pub fn with_max_memory_mb(self, max_memory_mb: usize) -> Self {
        Self {
            max_memory_mb,
            ..self
        }
    }

    /// Copy of these limits with a different worker limit.
    pub fn with_max_concurrent_workers(self, max_concurrent_workers: usize) -> Self {
        Self {
            max_concurrent_workers,
            ..self
        }
    }

    /// Memory budget in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(MB)
    }

    /// Whether `count` objects would exceed the object limit.
    pub fn exceeds_object_limit(&self, count: usize) -> bool {
        self.max_objects != 0 && count > self.max_objects
    }

    /// Reject limits that no component can honour.
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.max_memory_mb == 0 {
            return Err(LimitsError::InvalidLimit {
                field: "max_memory_mb",
                value: 0,
            });
        }
        if self.max_concurrent_workers == 0 {
            return Err(LimitsError::InvalidLimit {
                field: "max_concurrent_workers",
                value: 0,
            });
        }
        Ok(())
    }
}

/// Eviction policy used by a cache store instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry
    #[default]
    Lru,
    /// Evict the entry with the lowest access count (ties go to the least recent)
    Lfu,
    /// Expire entries older than `max_age_ms`, regardless of access
    Ttl { max_age_ms: u64 },
    /// Switch between LRU and LFU ranking based on the observed hit rate
    Adaptive,
}

impl EvictionPolicy {
    /// TTL policy with the given maximum age.
    pub fn ttl(max_age: Duration) -> Self {
        EvictionPolicy::Ttl {
            max_age_ms: max_age.as_millis() as u64,
        }
    }

    /// Maximum entry age, for the TTL policy.
    pub fn max_age(&self) -> Option<Duration> {
        match self {
            EvictionPolicy::Ttl { max_age_ms } => Some(Duration::from_millis(*max_age_ms)),
            _ => None,
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Ttl { max_age_ms } => write!(f, "ttl:{}", max_age_ms),
            EvictionPolicy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = LimitsError;

    /// Parses `lru`, `lfu`, `adaptive` or `ttl:<millis>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "adaptive" => Ok(EvictionPolicy::Adaptive),
            other => {
                let millis = other
                    .strip_prefix("ttl:")
                    .and_then(|ms| ms.parse::<u64>().ok())
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| LimitsError::UnknownPolicy(s.to_string()))?;
                Ok(EvictionPolicy::Ttl { max_age_ms: millis })
            }
        }
    }
}

/// Errors produced while validating limits or parsing a policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
    #[error("invalid value {value} for limit `{field}`")]
    InvalidLimit { field: &'static str, value: usize },

    #[error("unknown eviction policy `{0}`")]
    UnknownPolicy(String),
}
