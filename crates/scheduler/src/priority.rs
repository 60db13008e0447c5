//! Priority ordering for scheduled tasks
//!
//! Tasks are dispatched from a min-heap ordered by `(priority, sequence)`.
//! Lower priority values are more urgent; the sequence number is assigned at
//! enqueue so tasks of equal priority leave in submission order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use serde::{Deserialize, Serialize};

/// Task priority levels
///
/// Lower numeric values are more urgent and are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// User-initiated work that must land this tick
    Immediate = 0,

    /// Tiles currently in the viewport
    Visible = 1,

    /// Tiles just outside the viewport
    Margin = 2,

    /// Speculative decoding ahead of scrolling
    Prefetch = 3,

    /// Housekeeping that runs when nothing else is pending
    Idle = 4,
}

/// Unique task identifier
pub type TaskId = u64;

/// Dispatch key; derived ordering is `(priority, seq)` ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct QueueKey {
    pub priority: TaskPriority,
    pub seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    key: QueueKey,
    id: TaskId,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; reverse so the smallest key is on top.
        other.key.cmp(&self.key)
    }
}

/// Ready queue
///
/// The heap drives dispatch. `live` is the authoritative set of queued tasks:
/// removals (cancel, drop, timeout) only touch `live`, and heap entries whose
/// key is no longer live are skipped when popped. `live` is ordered by the
/// same key, which gives O(log n) access to the least urgent task when the
/// queue is full.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<HeapEntry>,
    live: BTreeMap<QueueKey, TaskId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: QueueKey, id: TaskId) {
        self.heap.push(HeapEntry { key, id });
        self.live.insert(key, id);
    }

    /// Pop the most urgent live task.
    pub fn pop(&mut self) -> Option<(QueueKey, TaskId)> {
        while let Some(entry) = self.heap.pop() {
            if self.live.remove(&entry.key).is_some() {
                return Some((entry.key, entry.id));
            }
        }
        None
    }

    /// Remove a queued task. The heap entry is discarded lazily.
    pub fn remove(&mut self, key: &QueueKey) -> bool {
        let removed = self.live.remove(key).is_some();
        if removed {
            self.compact_if_stale();
        }
        removed
    }

    /// The least urgent queued task.
    pub fn lowest(&self) -> Option<(QueueKey, TaskId)> {
        self.live.last_key_value().map(|(key, id)| (*key, *id))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Heap entries that no longer correspond to a queued task.
    pub fn stale_entries(&self) -> usize {
        self.heap.len() - self.live.len()
    }

    fn compact_if_stale(&mut self) {
        if self.stale_entries() > 64 && self.heap.len() > 2 * self.live.len() {
            self.heap = self
                .live
                .iter()
                .map(|(key, id)| HeapEntry { key: *key, id: *id })
                .collect();
        }
    }
}
