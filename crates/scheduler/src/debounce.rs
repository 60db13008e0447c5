//! Trailing debounce of keyed tasks
//!
//! Each key holds at most one pending task. Submitting under a key that is
//! still waiting replaces the older task and restarts the delay, so only the
//! last submission in a burst is ever queued.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::priority::TaskId;
use crate::task::QueuedTask;

struct Debounced<T> {
    task: QueuedTask<T>,
    due_at: Instant,
}

pub(crate) struct DebounceTable<T> {
    pending: HashMap<String, Debounced<T>>,
    due: BTreeMap<(Instant, TaskId), String>,
    keys: HashMap<TaskId, String>,
}

impl<T> DebounceTable<T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            due: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Park `task` under `key` until `due_at`, returning the task it
    /// superseded.
    pub fn insert(&mut self, key: String, task: QueuedTask<T>, due_at: Instant) -> Option<QueuedTask<T>> {
        let previous = self.remove_key(&key);
        self.due.insert((due_at, task.id), key.clone());
        self.keys.insert(task.id, key.clone());
        self.pending.insert(key, Debounced { task, due_at });
        previous
    }

    /// Remove every task whose delay has elapsed, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<QueuedTask<T>> {
        let mut ready = Vec::new();
        while let Some(entry) = self.due.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            if let Some(debounced) = self.pending.remove(&key) {
                self.keys.remove(&debounced.task.id);
                ready.push(debounced.task);
            }
        }
        ready
    }

    pub fn remove_id(&mut self, id: TaskId) -> Option<QueuedTask<T>> {
        let key = self.keys.get(&id)?.clone();
        self.remove_key(&key)
    }

    pub fn drain_all(&mut self) -> Vec<QueuedTask<T>> {
        self.due.clear();
        self.keys.clear();
        self.pending.drain().map(|(_, debounced)| debounced.task).collect()
    }

    /// Earliest pending due time.
    pub fn next_due(&self) -> Option<Instant> {
        self.due.first_key_value().map(|((due_at, _), _)| *due_at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn remove_key(&mut self, key: &str) -> Option<QueuedTask<T>> {
        let debounced = self.pending.remove(key)?;
        self.due.remove(&(debounced.due_at, debounced.task.id));
        self.keys.remove(&debounced.task.id);
        Some(debounced.task)
    }
}
