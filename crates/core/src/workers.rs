//! Admission control for background workers
//!
//! Every background thread doing producer work holds a [`WorkerPermit`] while
//! it runs. The table enforces `max_concurrent_workers`: the blocking entry
//! point waits for a slot, the `try_` variant fails fast. Dropping a permit
//! frees its slot and wakes one waiter.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tilebay_scheduler::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RegistryError, RegistryResult};

/// Identifier of an admitted worker
pub type WorkerId = u64;

/// What the registry knows about a running worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub name: String,
    pub started_at: Instant,
    pub cancelled: bool,
}

struct WorkerEntry {
    name: String,
    started_at: Instant,
    token: CancellationToken,
}

struct WorkerState {
    active: HashMap<WorkerId, WorkerEntry>,
    limit: usize,
    next_id: WorkerId,
    peak: usize,
    admitted_total: u64,
    rejected_total: u64,
}

pub(crate) struct WorkerTable {
    state: Mutex<WorkerState>,
    released: Condvar,
}

impl WorkerTable {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                active: HashMap::new(),
                limit: limit.max(1),
                next_id: 1,
                peak: 0,
                admitted_total: 0,
                rejected_total: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
        // A raised limit may admit several waiters at once.
        self.released.notify_all();
    }

    /// Admit a worker, waiting as long as it takes for a free slot.
    pub fn admit_blocking(self: &Arc<Self>, name: String, token: CancellationToken) -> WorkerPermit {
        let mut state = self.lock();
        while state.active.len() >= state.limit {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.insert(state, name, token)
    }

    /// Admit a worker, waiting at most `timeout` for a free slot.
    pub fn admit_within(
        self: &Arc<Self>,
        name: String,
        token: CancellationToken,
        timeout: Duration,
    ) -> RegistryResult<WorkerPermit> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.active.len() >= state.limit {
            let now = Instant::now();
            if now >= deadline {
                state.rejected_total += 1;
                return Err(RegistryError::WorkerLimitReached { limit: state.limit });
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(self.insert(state, name, token))
    }

    fn insert(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, WorkerState>,
        name: String,
        token: CancellationToken,
    ) -> WorkerPermit {
        let id = state.next_id;
        state.next_id += 1;
        state.admitted_total += 1;
        state.active.insert(
            id,
            WorkerEntry {
                name: name.clone(),
                started_at: Instant::now(),
                token: token.clone(),
            },
        );
        state.peak = state.peak.max(state.active.len());
        let active = state.active.len();
        drop(state);

        trace!(worker = id, name = %name, active, "worker admitted");
        WorkerPermit {
            id,
            name,
            token,
            table: Arc::clone(self),
        }
    }

    pub fn release(&self, id: WorkerId) -> bool {
        let removed = self.lock().active.remove(&id).is_some();
        if removed {
            self.released.notify_one();
        }
        removed
    }

    /// Cancel the tokens of workers running longer than `grace`.
    pub fn cancel_older_than(&self, grace: Duration) -> usize {
        let state = self.lock();
        let mut cancelled = 0;
        for (id, entry) in &state.active {
            if entry.started_at.elapsed() >= grace && !entry.token.is_cancelled() {
                entry.token.cancel();
                cancelled += 1;
                debug!(worker = id, name = %entry.name, "cancelled long-running worker");
            }
        }
        cancelled
    }

    pub fn active(&self) -> usize {
        self.lock().active.len()
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let state = self.lock();
        let mut workers: Vec<_> = state
            .active
            .iter()
            .map(|(id, entry)| WorkerInfo {
                id: *id,
                name: entry.name.clone(),
                started_at: entry.started_at,
                cancelled: entry.token.is_cancelled(),
            })
            .collect();
        workers.sort_by_key(|worker| worker.id);
        workers
    }

    pub fn counters(&self) -> WorkerCounters {
        let state = self.lock();
        WorkerCounters {
            active: state.active.len(),
            peak: state.peak,
            admitted: state.admitted_total,
            rejected: state.rejected_total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WorkerCounters {
    pub active: usize,
    pub peak: usize,
    pub admitted: u64,
    pub rejected: u64,
}

/// Proof of admission for one background worker
///
/// Releases the worker's slot when dropped.
pub struct WorkerPermit {
    id: WorkerId,
    name: String,
    token: CancellationToken,
    table: Arc<WorkerTable>,
}

impl WorkerPermit {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token cancelled by aggressive cleanup once the worker outlives its
    /// grace period.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

impl fmt::Debug for WorkerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPermit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
