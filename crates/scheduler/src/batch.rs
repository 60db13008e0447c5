//! Coalesced UI mutations
//!
//! Producers on any thread push closures; the UI thread flushes them in one
//! pass per tick. A flush swaps the pending list out under the lock and runs
//! it after releasing the lock, so producers are never blocked behind UI work
//! and a mutation pushed during a flush lands in the next one. A mutation
//! that panics is logged and skipped; the rest of the batch still applies.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, trace};

/// A deferred mutation of UI state.
pub type UiMutation = Box<dyn FnOnce() + Send>;

/// When a batch should be flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchTrigger {
    /// Flush once this many mutations are pending.
    pub max_items: usize,
    /// Flush once the oldest pending mutation is this old.
    pub max_age_ms: u64,
}

impl Default for BatchTrigger {
    fn default() -> Self {
        Self {
            max_items: 64,
            max_age_ms: 16,
        }
    }
}

impl BatchTrigger {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// Counters for an [`UpdateBatch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub pending: usize,
    pub flushes: u64,
    pub applied: u64,
    /// Mutations that panicked while being applied
    pub panicked: u64,
}

#[derive(Default)]
struct BatchState {
    items: Vec<UiMutation>,
    oldest: Option<Instant>,
    flushes: u64,
    applied: u64,
    panicked: u64,
}

/// Thread-safe queue of UI mutations applied in batches
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use tilebay_scheduler::UpdateBatch;
///
/// let batch = UpdateBatch::default();
/// let painted = Arc::new(AtomicUsize::new(0));
/// for _ in 0..3 {
///     let painted = painted.clone();
///     batch.push(move || {
///         painted.fetch_add(1, Ordering::SeqCst);
///     });
/// }
/// assert_eq!(batch.flush(), 3);
/// assert_eq!(painted.load(Ordering::SeqCst), 3);
/// ```
pub struct UpdateBatch {
    trigger: BatchTrigger,
    state: Mutex<BatchState>,
}

impl UpdateBatch {
    pub fn new(trigger: BatchTrigger) -> Self {
        Self {
            trigger,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn trigger(&self) -> BatchTrigger {
        self.trigger
    }

    /// Queue a mutation. Returns whether the batch is now due.
    pub fn push<F>(&self, mutation: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        let now = Instant::now();
        state.oldest.get_or_insert(now);
        state.items.push(Box::new(mutation));
        self.due(&state, now)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether the size or age threshold has been reached.
    pub fn is_due(&self) -> bool {
        let state = self.lock();
        self.due(&state, Instant::now())
    }

    /// Apply every pending mutation in push order. Returns how many were
    /// applied, counting ones that panicked.
    pub fn flush(&self) -> usize {
        let items = {
            let mut state = self.lock();
            state.oldest = None;
            mem::take(&mut state.items)
        };
        let count = items.len();
        if count == 0 {
            return 0;
        }

        let mut panicked = 0;
        for (index, mutation) in items.into_iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(mutation)).is_err() {
                panicked += 1;
                error!(index, count, "ui mutation panicked");
            }
        }

        let mut state = self.lock();
        state.flushes += 1;
        state.applied += count as u64;
        state.panicked += panicked;
        trace!(count, panicked, "flushed ui batch");
        count
    }

    /// Flush only if a threshold has been reached.
    pub fn flush_if_due(&self) -> usize {
        if self.is_due() {
            self.flush()
        } else {
            0
        }
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.lock();
        BatchStats {
            pending: state.items.len(),
            flushes: state.flushes,
            applied: state.applied,
            panicked: state.panicked,
        }
    }

    fn due(&self, state: &BatchState, now: Instant) -> bool {
        if state.items.is_empty() {
            return false;
        }
        state.items.len() >= self.trigger.max_items
            || state
                .oldest
                .is_some_and(|oldest| now.duration_since(oldest) >= self.trigger.max_age())
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for UpdateBatch {
    fn default() -> Self {
        Self::new(BatchTrigger::default())
    }
}

impl fmt::Debug for UpdateBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateBatch")
            .field("trigger", &self.trigger)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_flush_preserves_push_order() {
        let batch = UpdateBatch::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            batch.push(move || log.lock().unwrap().push(i));
        }

        assert_eq!(batch.flush(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(batch.is_empty());
        assert_eq!(batch.flush(), 0);
    }

    #[test]
    fn test_size_trigger() {
        let batch = UpdateBatch::new(BatchTrigger {
            max_items: 3,
            max_age_ms: 60_000,
        });
        assert!(!batch.push(|| {}));
        assert!(!batch.push(|| {}));
        assert!(batch.push(|| {}));
        assert!(batch.is_due());
        assert_eq!(batch.flush_if_due(), 3);
        assert!(!batch.is_due());
    }

    #[test]
    fn test_age_trigger() {
        let batch = UpdateBatch::new(BatchTrigger {
            max_items: 1000,
            max_age_ms: 5,
        });
        assert!(!batch.is_due());
        batch.push(|| {});
        assert_eq!(batch.flush_if_due(), 0);

        thread::sleep(Duration::from_millis(10));
        assert!(batch.is_due());
        assert_eq!(batch.flush_if_due(), 1);
    }

    #[test]
    fn test_push_during_flush_lands_in_next_batch() {
        let batch = Arc::new(UpdateBatch::default());
        let inner = batch.clone();
        batch.push(move || {
            inner.push(|| {});
        });

        assert_eq!(batch.flush(), 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.flush(), 1);
    }

    #[test]
    fn test_panicking_mutation_does_not_lose_the_rest() {
        let batch = UpdateBatch::default();
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let ran = ran.clone();
            batch.push(move || {
                if i == 1 {
                    panic!("stale tile");
                }
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(batch.flush(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(batch.is_empty());

        let stats = batch.stats();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.flushes, 1);
    }

    #[test]
    fn test_stats() {
        let batch = UpdateBatch::default();
        batch.push(|| {});
        batch.push(|| {});
        batch.flush();
        batch.push(|| {});

        let stats = batch.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.applied, 2);
    }

    #[test]
    fn test_concurrent_pushes_are_applied_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let batch = Arc::new(UpdateBatch::default());
        let applied = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let flusher = {
            let batch = batch.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut total = 0;
                while !done.load(Ordering::SeqCst) {
                    total += batch.flush();
                    thread::yield_now();
                }
                total + batch.flush()
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let batch = batch.clone();
                let applied = applied.clone();
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let applied = applied.clone();
                        batch.push(move || {
                            applied.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let flushed = flusher.join().unwrap();

        assert_eq!(flushed, PRODUCERS * PER_PRODUCER);
        assert_eq!(applied.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
        assert!(batch.is_empty());
    }
}
