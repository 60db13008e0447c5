//! Time slices and adaptive chunking for work done on the UI thread
//!
//! A UI tick has roughly one frame of time to spare. `SliceBudget` bounds how
//! long a drain or a creation chunk may run, and `ChunkedOperation` splits a
//! long run of items into chunks whose size follows memory pressure and the
//! time the previous chunk actually took.

use std::time::{Duration, Instant};

/// Time budget for one slice of work
///
/// The clock starts at construction. Callers check `is_exceeded` before
/// starting each unit of work; a unit that has already started is never
/// interrupted, so one slice can overrun by at most one unit.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tilebay_scheduler::frame_budget::SliceBudget;
///
/// let budget = SliceBudget::new(Duration::from_millis(16));
/// let mut done = 0;
/// while done < 10 && !budget.is_exceeded() {
///     done += 1;
/// }
/// assert_eq!(done, 10);
/// ```
#[derive(Debug, Clone)]
pub struct SliceBudget {
    started: Instant,
    budget: Duration,
}

impl SliceBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget left, or `Duration::ZERO` once exhausted.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_exceeded(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// How far past the budget the slice ran.
    pub fn overrun(&self) -> Duration {
        self.elapsed().saturating_sub(self.budget)
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Progress and chunk sizing for a long run of items
///
/// The chunk size starts at the baseline. `shrink` halves it, `collapse`
/// drops it to the minimum, and `grow` moves it back toward the baseline by
/// half of the current size per call.
///
/// # Example
///
/// ```
/// use tilebay_scheduler::frame_budget::ChunkedOperation;
///
/// let mut op = ChunkedOperation::new(1000).with_chunk_size(100);
/// assert_eq!(op.items_for_chunk(), 100);
///
/// op.advance(100);
/// op.shrink();
/// assert_eq!(op.items_for_chunk(), 50);
/// assert!(!op.is_complete());
/// ```
#[derive(Debug, Clone)]
pub struct ChunkedOperation {
    total: u64,
    processed: u64,
    chunk_size: u64,
    baseline: u64,
    min_chunk: u64,
    chunks_used: u32,
}

impl ChunkedOperation {
    /// Default items per chunk.
    pub const DEFAULT_CHUNK: u64 = 50;

    /// Create a tracker for `total` items
    pub fn new(total: u64) -> Self {
        Self {
            total,
            processed: 0,
            chunk_size: Self::DEFAULT_CHUNK,
            baseline: Self::DEFAULT_CHUNK,
            min_chunk: 1,
            chunks_used: 0,
        }
    }

    /// Set the baseline chunk size (items per chunk)
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.baseline = chunk_size.max(1);
        self.chunk_size = self.baseline;
        self.min_chunk = self.min_chunk.min(self.baseline);
        self
    }

    /// Set the floor used by `shrink` and `collapse`
    pub fn with_min_chunk(mut self, min_chunk: u64) -> Self {
        self.min_chunk = min_chunk.clamp(1, self.baseline);
        self
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed)
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }

    pub fn advance(&mut self, count: u64) {
        self.processed = self.processed.saturating_add(count).min(self.total);
    }

    pub fn complete_chunk(&mut self) {
        self.chunks_used += 1;
    }

    pub fn chunks_used(&self) -> u32 {
        self.chunks_used
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    pub fn min_chunk(&self) -> u64 {
        self.min_chunk
    }

    /// Items to process in the next chunk
    pub fn items_for_chunk(&self) -> u64 {
        self.remaining().min(self.chunk_size)
    }

    /// Halve the chunk size, never below the minimum.
    pub fn shrink(&mut self) {
        self.chunk_size = (self.chunk_size / 2).max(self.min_chunk);
    }

    /// Drop straight to the minimum chunk size.
    pub fn collapse(&mut self) {
        self.chunk_size = self.min_chunk;
    }

    /// Grow by half of the current size, capped at the baseline.
    pub fn grow(&mut self) {
        let step = (self.chunk_size / 2).max(1);
        self.chunk_size = (self.chunk_size + step).min(self.baseline);
    }
}
