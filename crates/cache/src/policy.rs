//! Ordered eviction indices for the cache store.
//!
//! Every policy ranks entries by a `(u64, u64)` pair kept in a `BTreeMap`,
//! so finding and removing a victim is O(log n). Ticks come from a logical
//! clock owned by the store and are unique per entry, which keeps every rank
//! unique as well.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EvictionPolicy;

/// Number of lookups per adaptive measurement window.
pub const ADAPTIVE_WINDOW: u32 = 64;

/// Hit-rate drop (absolute) that makes the adaptive policy switch ranking.
pub const ADAPTIVE_SWITCH_MARGIN: f64 = 0.05;

type Rank = (u64, u64);

/// Ranking currently used by the adaptive policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptiveMode {
    /// Rank by last access (LRU)
    Recency,
    /// Rank by access count (LFU)
    Frequency,
}

impl AdaptiveMode {
    fn flipped(self) -> Self {
        match self {
            AdaptiveMode::Recency => AdaptiveMode::Frequency,
            AdaptiveMode::Frequency => AdaptiveMode::Recency,
        }
    }
}

/// Ranking metadata of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    /// Tick at insertion
    pub created_tick: u64,
    /// Tick at last access (insertion counts as an access)
    pub access_tick: u64,
    /// Number of accesses, insertion included
    pub access_count: u64,
    /// Wall-clock insertion time, used for TTL expiry
    pub created_at: Instant,
}

impl EntryMeta {
    fn recency_rank(&self) -> Rank {
        (self.access_tick, self.created_tick)
    }

    fn frequency_rank(&self) -> Rank {
        (self.access_count, self.access_tick)
    }

    fn age_rank(&self) -> Rank {
        (self.created_tick, 0)
    }
}

/// Hit/miss bookkeeping for the adaptive policy.
#[derive(Debug, Clone, Default)]
struct HitWindow {
    lookups: u32,
    hits: u32,
    previous_rate: Option<f64>,
}

impl HitWindow {
    /// Records a lookup; returns true when the mode should flip.
    fn record(&mut self, hit: bool) -> bool {
        self.lookups += 1;
        if hit {
            self.hits += 1;
        }
        if self.lookups < ADAPTIVE_WINDOW {
            return false;
        }

        let rate = self.hits as f64 / self.lookups as f64;
        let degraded = self
            .previous_rate
            .is_some_and(|previous| rate + ADAPTIVE_SWITCH_MARGIN < previous);
        self.previous_rate = Some(rate);
        self.lookups = 0;
        self.hits = 0;
        degraded
    }
}

/// Eviction index for one cache store.
#[derive(Debug)]
pub(crate) struct EvictionIndex<K> {
    policy: EvictionPolicy,
    by_recency: Option<BTreeMap<Rank, K>>,
    by_frequency: Option<BTreeMap<Rank, K>>,
    by_age: Option<BTreeMap<Rank, K>>,
    mode: AdaptiveMode,
    window: HitWindow,
}

impl<K: Clone> EvictionIndex<K> {
    pub fn new(policy: EvictionPolicy) -> Self {
        let (recency, frequency, age) = match policy {
            EvictionPolicy::Lru => (true, false, false),
            EvictionPolicy::Lfu => (false, true, false),
            EvictionPolicy::Ttl { .. } => (false, false, true),
            EvictionPolicy::Adaptive => (true, true, false),
        };
        Self {
            policy,
            by_recency: recency.then(BTreeMap::new),
            by_frequency: frequency.then(BTreeMap::new),
            by_age: age.then(BTreeMap::new),
            mode: AdaptiveMode::Recency,
            window: HitWindow::default(),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Current adaptive ranking, `None` for the fixed policies.
    pub fn adaptive_mode(&self) -> Option<AdaptiveMode> {
        matches!(self.policy, EvictionPolicy::Adaptive).then_some(self.mode)
    }

    pub fn insert(&mut self, meta: &EntryMeta, key: &K) {
        if let Some(map) = self.by_recency.as_mut() {
            map.insert(meta.recency_rank(), key.clone());
        }
        if let Some(map) = self.by_frequency.as_mut() {
            map.insert(meta.frequency_rank(), key.clone());
        }
        if let Some(map) = self.by_age.as_mut() {
            map.insert(meta.age_rank(), key.clone());
        }
    }

    pub fn remove(&mut self, meta: &EntryMeta) {
        if let Some(map) = self.by_recency.as_mut() {
            map.remove(&meta.recency_rank());
        }
        if let Some(map) = self.by_frequency.as_mut() {
            map.remove(&meta.frequency_rank());
        }
        if let Some(map) = self.by_age.as_mut() {
            map.remove(&meta.age_rank());
        }
    }

    /// Re-rank an entry after an access.
    pub fn touch(&mut self, before: &EntryMeta, after: &EntryMeta, key: &K) {
        if let Some(map) = self.by_recency.as_mut() {
            map.remove(&before.recency_rank());
            map.insert(after.recency_rank(), key.clone());
        }
        if let Some(map) = self.by_frequency.as_mut() {
            map.remove(&before.frequency_rank());
            map.insert(after.frequency_rank(), key.clone());
        }
        // Age rank never changes on access.
    }

    /// Next entry to evict under the active ranking.
    pub fn victim(&self) -> Option<&K> {
        let map = match self.policy {
            EvictionPolicy::Lru => self.by_recency.as_ref(),
            EvictionPolicy::Lfu => self.by_frequency.as_ref(),
            EvictionPolicy::Ttl { .. } => self.by_age.as_ref(),
            EvictionPolicy::Adaptive => match self.mode {
                AdaptiveMode::Recency => self.by_recency.as_ref(),
                AdaptiveMode::Frequency => self.by_frequency.as_ref(),
            },
        };
        map.and_then(|m| m.values().next())
    }

    /// Oldest entry by insertion, for TTL expiry scans.
    pub fn oldest(&self) -> Option<&K> {
        self.by_age.as_ref().and_then(|m| m.values().next())
    }

    /// Feed a lookup result to the adaptive policy.
    pub fn record_lookup(&mut self, hit: bool) {
        if !matches!(self.policy, EvictionPolicy::Adaptive) {
            return;
        }
        if self.window.record(hit) {
            let next = self.mode.flipped();
            debug!(from = ?self.mode, to = ?next, "adaptive cache switching ranking");
            self.mode = next;
        }
    }

    pub fn clear(&mut self) {
        for map in [
            self.by_recency.as_mut(),
            self.by_frequency.as_mut(),
            self.by_age.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            map.clear();
        }
    }
}
