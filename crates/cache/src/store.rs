//! Bounded key/value store with pluggable eviction
//!
//! Holds decoded previews (or any other payload) under a memory and entry
//! budget. When a `put` would exceed either limit, entries are evicted in the
//! order given by the store's [`EvictionPolicy`] until the new entry fits.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{EvictionPolicy, ResourceLimits};
use crate::monitor::PressureLevel;
use crate::policy::{AdaptiveMode, EntryMeta, EvictionIndex};

/// Fraction of the budget kept after relieving Warning pressure.
pub const WARNING_TARGET_FRACTION: f64 = 0.80;

/// Fraction of the budget kept after relieving Critical pressure.
pub const CRITICAL_TARGET_FRACTION: f64 = 0.50;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Number of entries currently cached
    pub entry_count: usize,

    /// Sum of size estimates of cached entries (bytes)
    pub bytes_used: usize,

    /// Memory budget (bytes)
    pub memory_limit: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted to make room or relieve pressure
    pub evictions: u64,

    /// Number of puts refused because the value exceeded the whole budget
    pub rejected: u64,

    /// Number of entries dropped because their TTL ran out
    pub expired: u64,

    /// Ranking used by the adaptive policy, if the store is adaptive
    pub adaptive_mode: Option<AdaptiveMode>,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.memory_limit as f64
        }
    }
}

/// What happened to a value handed to [`CacheStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored under a new key
    Stored { evicted: usize },
    /// Stored, replacing an existing value under the same key
    Replaced { evicted: usize },
    /// Not cached: the value alone is larger than the whole budget
    Rejected { size: usize, budget: usize },
}

impl PutOutcome {
    /// Whether the value ended up in the cache.
    pub fn is_cached(&self) -> bool {
        !matches!(self, PutOutcome::Rejected { .. })
    }

    /// Number of entries evicted to make room.
    pub fn evicted(&self) -> usize {
        match self {
            PutOutcome::Stored { evicted } | PutOutcome::Replaced { evicted } => *evicted,
            PutOutcome::Rejected { .. } => 0,
        }
    }
}

/// Read-only view of an entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryInfo {
    pub size_estimate_bytes: usize,
    pub created_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
}

/// A cached value and its bookkeeping.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    size_estimate_bytes: usize,
    last_access_at: Instant,
    meta: EntryMeta,
}

impl<V> CacheEntry<V> {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            size_estimate_bytes: self.size_estimate_bytes,
            created_at: self.meta.created_at,
            last_access_at: self.last_access_at,
            access_count: self.meta.access_count,
        }
    }
}

/// Internal cache state
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    index: EvictionIndex<K>,
    bytes_used: usize,
    limits: ResourceLimits,
    /// Logical clock; every insert and access takes a fresh tick
    clock: u64,
    stats: CacheStats,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(limits: ResourceLimits, policy: EvictionPolicy) -> Self {
        let index = EvictionIndex::new(policy);
        Self {
            entries: HashMap::new(),
            stats: CacheStats {
                memory_limit: limits.max_memory_bytes(),
                adaptive_mode: index.adaptive_mode(),
                ..Default::default()
            },
            index,
            bytes_used: 0,
            limits,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn sync_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.bytes_used = self.bytes_used;
        self.stats.memory_limit = self.limits.max_memory_bytes();
        self.stats.adaptive_mode = self.index.adaptive_mode();
    }

    fn insert(&mut self, key: K, value: V, size: usize, now: Instant) {
        let tick = self.tick();
        let meta = EntryMeta {
            created_tick: tick,
            access_tick: tick,
            access_count: 1,
            created_at: now,
        };
        self.index.insert(&meta, &key);
        self.bytes_used += size;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                size_estimate_bytes: size,
                last_access_at: now,
                meta,
            },
        );
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.index.remove(&entry.meta);
        self.bytes_used = self.bytes_used.saturating_sub(entry.size_estimate_bytes);
        Some(entry)
    }

    /// Record an access and return the entry.
    fn touch(&mut self, key: &K, now: Instant) -> Option<&CacheEntry<V>> {
        let tick = self.tick();
        let CacheState { entries, index, .. } = self;
        let entry = entries.get_mut(key)?;
        let before = entry.meta;
        entry.meta.access_tick = tick;
        entry.meta.access_count += 1;
        entry.last_access_at = now;
        index.touch(&before, &entry.meta, key);
        Some(entry)
    }

    fn is_expired(&self, key: &K, now: Instant) -> bool {
        match (self.index.policy().max_age(), self.entries.get(key)) {
            (Some(max_age), Some(entry)) => expired(entry.meta.created_at, now, max_age),
            _ => false,
        }
    }

    /// Drop every entry whose TTL has run out. Oldest entries come first in
    /// the age index, so this stops at the first live one.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.index.policy().max_age() else {
            return 0;
        };
        let mut purged = 0;
        while let Some(key) = self.index.oldest().cloned() {
            let created_at = match self.entries.get(&key) {
                Some(entry) => entry.meta.created_at,
                None => break,
            };
            if !expired(created_at, now, max_age) {
                break;
            }
            self.remove(&key);
            purged += 1;
        }
        self.stats.expired += purged as u64;
        purged
    }

    fn over_budget(&self, incoming_bytes: usize, incoming_entries: usize) -> bool {
        self.bytes_used.saturating_add(incoming_bytes) > self.limits.max_memory_bytes()
            || self
                .limits
                .exceeds_object_limit(self.entries.len() + incoming_entries)
    }

    /// Evict until an entry of `incoming_bytes` fits.
    fn evict_to_fit(&mut self, incoming_bytes: usize, incoming_entries: usize) -> usize {
        let mut evicted = 0;
        while self.over_budget(incoming_bytes, incoming_entries) {
            let Some(victim) = self.index.victim().cloned() else {
                break;
            };
            if self.remove(&victim).is_none() {
                break;
            }
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Evict until usage is at or below `target_bytes`.
    fn evict_down_to(&mut self, target_bytes: usize) -> usize {
        let mut evicted = 0;
        while self.bytes_used > target_bytes {
            let Some(victim) = self.index.victim().cloned() else {
                break;
            };
            if self.remove(&victim).is_none() {
                break;
            }
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        evicted
    }
}

fn expired(created_at: Instant, now: Instant, max_age: Duration) -> bool {
    now.saturating_duration_since(created_at) >= max_age
}

/// Bounded cache with LRU, LFU, TTL or adaptive eviction
///
/// Thread-safe; all operations take one internal lock for the duration of the
/// structural change only. Cloning a `CacheStore` yields another handle to the
/// same cache.
///
/// # Example
///
/// ```
/// use tilebay_cache::{CacheStore, EvictionPolicy, ResourceLimits};
///
/// let cache = CacheStore::new(ResourceLimits::default(), EvictionPolicy::Lru);
///
/// cache.put("cover.png", vec![0u8; 4096], 4096);
/// assert_eq!(cache.get(&"cover.png").map(|v| v.len()), Some(4096));
///
/// let stats = cache.stats();
/// assert_eq!(stats.hits, 1);
/// assert_eq!(stats.bytes_used, 4096);
/// ```
pub struct CacheStore<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
}

impl<K, V> Clone for CacheStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a store with the given limits and eviction policy.
    pub fn new(limits: ResourceLimits, policy: EvictionPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new(limits, policy))),
        }
    }

    /// Create an LRU store with a memory budget in megabytes and no entry limit.
    pub fn with_mb_limit(megabytes: usize) -> Self {
        Self::new(
            ResourceLimits::default()
                .with_max_memory_mb(megabytes)
                .with_max_objects(0),
            EvictionPolicy::Lru,
        )
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a value.
    ///
    /// Evicts entries (per the policy) until the value fits. Never fails: a
    /// value bigger than the entire budget is not cached, any stale value under
    /// the same key is dropped, and the refusal is logged and counted.
    pub fn put(&self, key: K, value: V, size_hint: usize) -> PutOutcome {
        let now = Instant::now();
        let mut state = self.lock();

        let replaced = state.remove(&key).is_some();
        let budget = state.limits.max_memory_bytes();

        if size_hint > budget {
            state.stats.rejected += 1;
            state.sync_stats();
            drop(state);
            warn!(
                size = size_hint,
                budget, "value larger than the cache budget, passing through uncached"
            );
            return PutOutcome::Rejected {
                size: size_hint,
                budget,
            };
        }

        state.purge_expired(now);
        let evicted = state.evict_to_fit(size_hint, 1);
        state.insert(key, value, size_hint, now);
        state.sync_stats();
        let bytes_used = state.bytes_used;
        drop(state);

        if evicted > 0 {
            debug!(evicted, bytes_used, "cache eviction pass");
        }

        if replaced {
            PutOutcome::Replaced { evicted }
        } else {
            PutOutcome::Stored { evicted }
        }
    }

    /// Remove a value. Returns true if it was cached.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut state = self.lock();
        let removed = state.remove(key).is_some();
        state.sync_stats();
        removed
    }

    /// Remove every value.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.index.clear();
        state.bytes_used = 0;
        state.sync_stats();
    }

    /// Check if a key is cached without updating recency
    pub fn contains(&self, key: &K) -> bool {
        let state = self.lock();
        state.entries.contains_key(key) && !state.is_expired(key, Instant::now())
    }

    /// Bookkeeping for a cached key, without updating recency.
    pub fn entry_info(&self, key: &K) -> Option<EntryInfo> {
        self.lock().entries.get(key).map(CacheEntry::info)
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Eviction policy of this store.
    pub fn policy(&self) -> EvictionPolicy {
        self.lock().index.policy()
    }

    /// Limits currently enforced.
    pub fn limits(&self) -> ResourceLimits {
        self.lock().limits
    }

    /// Replace the limits wholesale, evicting down to the new budget.
    ///
    /// Returns the number of evicted entries.
    pub fn set_limits(&self, limits: ResourceLimits) -> usize {
        let mut state = self.lock();
        state.limits = limits;
        let evicted = state.evict_to_fit(0, 0);
        state.sync_stats();
        evicted
    }

    /// Drop entries whose TTL has run out. A no-op for other policies.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        let purged = state.purge_expired(Instant::now());
        state.sync_stats();
        purged
    }

    /// Shrink the cache in response to memory pressure.
    ///
    /// Warning keeps 80% of the budget, Critical keeps 50%. Normal and Unknown
    /// only purge expired entries.
    pub fn relieve_pressure(&self, level: PressureLevel) -> usize {
        let mut state = self.lock();
        let purged = state.purge_expired(Instant::now());
        let budget = state.limits.max_memory_bytes() as f64;
        let evicted = match level {
            PressureLevel::Warning => {
                state.evict_down_to((budget * WARNING_TARGET_FRACTION) as usize)
            }
            PressureLevel::Critical => {
                state.evict_down_to((budget * CRITICAL_TARGET_FRACTION) as usize)
            }
            PressureLevel::Normal | PressureLevel::Unknown => 0,
        };
        state.sync_stats();
        let bytes_used = state.bytes_used;
        drop(state);

        if evicted > 0 {
            debug!(%level, evicted, bytes_used, "cache shrunk under memory pressure");
        }
        purged + evicted
    }

    /// Get the current memory usage in bytes
    pub fn bytes_used(&self) -> usize {
        self.lock().bytes_used
    }

    /// Get the number of cached entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Retrieve a value, updating recency and frequency metadata.
    ///
    /// Expired TTL entries count as misses and are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        Self::lookup(&mut state, key)
    }

    /// Non-blocking variant of [`get`](Self::get).
    ///
    /// - `Some(Some(value))`: hit
    /// - `Some(None)`: miss
    /// - `None`: the cache is busy
    pub fn try_get(&self, key: &K) -> Option<Option<V>> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        Some(Self::lookup(&mut state, key))
    }

    /// Read a value without touching recency, frequency or statistics.
    pub fn peek(&self, key: &K) -> Option<V> {
        let state = self.lock();
        if state.is_expired(key, Instant::now()) {
            return None;
        }
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    fn lookup(state: &mut CacheState<K, V>, key: &K) -> Option<V> {
        let now = Instant::now();
        if state.is_expired(key, now) {
            state.remove(key);
            state.stats.expired += 1;
            state.stats.misses += 1;
            state.index.record_lookup(false);
            state.sync_stats();
            return None;
        }

        let value = state.touch(key, now).map(|entry| entry.value.clone());
        match value {
            Some(value) => {
                state.stats.hits += 1;
                state.index.record_lookup(true);
                state.stats.adaptive_mode = state.index.adaptive_mode();
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                state.index.record_lookup(false);
                state.stats.adaptive_mode = state.index.adaptive_mode();
                None
            }
        }
    }
}
