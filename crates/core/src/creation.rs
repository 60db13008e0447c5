//! Bulk creation of managed objects in adaptively sized chunks
//!
//! Creating thousands of tiles in one pass would stall the UI. A
//! [`CreationRun`] builds and registers objects one chunk at a time and hands
//! control back to the caller between chunks. Chunk size follows memory
//! pressure and how long the previous chunk took; registration rejections
//! are retried on a later chunk.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tilebay_cache::PressureLevel;
use tilebay_scheduler::frame_budget::{ChunkedOperation, SliceBudget};
use tilebay_scheduler::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::{ManagedObject, ManagedObjectHandle, ObjectState, ResourceRegistry};

/// Chunk sizing and retry policy for bulk creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreationOptions {
    /// Items per chunk when memory is healthy
    pub baseline_chunk: usize,

    /// Smallest chunk, used under critical pressure
    pub min_chunk: usize,

    /// Target time per chunk; an overrun halves the next chunk
    pub slice_budget_ms: u64,

    /// How often a rejected item is retried before counting as failed
    pub max_retries: u32,

    /// Register new objects as active (the UI is about to show them) or idle
    pub register_active: bool,
}

impl Default for CreationOptions {
    fn default() -> Self {
        Self {
            baseline_chunk: 50,
            min_chunk: 5,
            slice_budget_ms: 16,
            max_retries: 3,
            register_active: true,
        }
    }
}

impl CreationOptions {
    pub fn with_baseline_chunk(mut self, size: usize) -> Self {
        self.baseline_chunk = size;
        self
    }

    pub fn with_min_chunk(mut self, size: usize) -> Self {
        self.min_chunk = size;
        self
    }

    pub fn with_slice_budget(mut self, budget: Duration) -> Self {
        self.slice_budget_ms = budget.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn slice_budget(&self) -> Duration {
        Duration::from_millis(self.slice_budget_ms)
    }

    fn initial_state(&self) -> ObjectState {
        if self.register_active {
            ObjectState::Active
        } else {
            ObjectState::Idle
        }
    }
}

/// Where a creation run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreationStatus {
    Running,
    /// Slowed down by critical pressure or registration rejections
    Throttled,
    Completed,
    Cancelled,
}

impl CreationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, CreationStatus::Completed | CreationStatus::Cancelled)
    }
}

/// Progress of a creation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationProgress {
    pub created: usize,
    /// Factory errors plus items that ran out of retries
    pub failed: usize,
    /// Registration rejections, including ones later retried
    pub rejected: usize,
    pub remaining: usize,
    pub chunk_size: usize,
    pub chunks: u32,
    pub status: CreationStatus,
}

/// One created and registered object
pub struct Created<T> {
    pub object: Arc<T>,
    pub handle: ManagedObjectHandle,
}

impl<T> fmt::Debug for Created<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Created")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Starts creation runs against a registry
#[derive(Debug, Clone)]
pub struct BatchCreationController {
    registry: Arc<ResourceRegistry>,
    options: CreationOptions,
}

impl BatchCreationController {
    pub fn new(registry: Arc<ResourceRegistry>, options: CreationOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> CreationOptions {
        self.options
    }

    /// Create an object for every item, lazily.
    ///
    /// Nothing happens until the run is driven with
    /// [`next_chunk`](CreationRun::next_chunk) or as an iterator. A finished
    /// or cancelled run stays finished; start over by calling this again.
    pub fn create_all<I, T, E, F>(&self, items: I, factory: F) -> CreationRun<I::Item, T, F>
    where
        I: IntoIterator,
        T: ManagedObject + 'static,
        E: fmt::Display,
        F: FnMut(&I::Item) -> Result<Arc<T>, E>,
    {
        self.create_all_with_token(items, factory, CancellationToken::new())
    }

    /// Like [`create_all`](Self::create_all) with a caller-supplied token.
    pub fn create_all_with_token<I, T, E, F>(
        &self,
        items: I,
        factory: F,
        token: CancellationToken,
    ) -> CreationRun<I::Item, T, F>
    where
        I: IntoIterator,
        T: ManagedObject + 'static,
        E: fmt::Display,
        F: FnMut(&I::Item) -> Result<Arc<T>, E>,
    {
        let pending: VecDeque<_> = items.into_iter().collect();
        let baseline = self.options.baseline_chunk.max(1) as u64;
        let chunking = ChunkedOperation::new(pending.len() as u64)
            .with_chunk_size(baseline)
            .with_min_chunk(self.options.min_chunk as u64);

        CreationRun {
            registry: self.registry.clone(),
            options: self.options,
            pending,
            retry: VecDeque::new(),
            factory,
            token,
            chunking,
            status: CreationStatus::Running,
            created: 0,
            failed: 0,
            rejected: 0,
            last_chunk_healthy: true,
            buffer: VecDeque::new(),
        }
    }
}

/// A lazy, cancellable creation run
pub struct CreationRun<Item, T, F> {
    registry: Arc<ResourceRegistry>,
    options: CreationOptions,
    pending: VecDeque<Item>,
    retry: VecDeque<(Item, u32)>,
    factory: F,
    token: CancellationToken,
    chunking: ChunkedOperation,
    status: CreationStatus,
    created: usize,
    failed: usize,
    rejected: usize,
    last_chunk_healthy: bool,
    buffer: VecDeque<Created<T>>,
}

impl<Item, T, E, F> CreationRun<Item, T, F>
where
    T: ManagedObject + 'static,
    E: fmt::Display,
    F: FnMut(&Item) -> Result<Arc<T>, E>,
{
    /// Create and register the next chunk.
    ///
    /// Returns `None` once the run is completed or cancelled. A chunk may be
    /// empty when every item in it failed or was deferred for retry.
    pub fn next_chunk(&mut self) -> Option<Vec<Created<T>>> {
        if self.status.is_finished() {
            return None;
        }
        if self.token.is_cancelled() {
            self.status = CreationStatus::Cancelled;
            info!(
                created = self.created,
                remaining = self.remaining(),
                "creation run cancelled"
            );
            return None;
        }
        if self.remaining() == 0 {
            self.finish();
            return None;
        }

        let pressure = self.registry.memory_usage().pressure_level;
        self.resize_for(pressure);

        let budget = SliceBudget::new(self.options.slice_budget());
        let size = self.chunking.chunk_size() as usize;
        let mut batch: Vec<(Item, u32)> = Vec::with_capacity(size);
        while batch.len() < size {
            if let Some(retry) = self.retry.pop_front() {
                batch.push(retry);
            } else if let Some(item) = self.pending.pop_front() {
                batch.push((item, 0));
            } else {
                break;
            }
        }

        let mut created = Vec::with_capacity(batch.len());
        let mut rejected_here = 0;
        let mut settled = 0u64;
        for (item, attempts) in batch {
            match self.create_one(&item) {
                Ok(done) => {
                    created.push(done);
                    settled += 1;
                }
                Err(Outcome::Rejected) => {
                    rejected_here += 1;
                    self.rejected += 1;
                    if attempts < self.options.max_retries {
                        self.retry.push_back((item, attempts + 1));
                    } else {
                        warn!(attempts, "giving up on item after repeated rejections");
                        self.failed += 1;
                        settled += 1;
                    }
                }
                Err(Outcome::Failed) => {
                    self.failed += 1;
                    settled += 1;
                }
            }
        }

        self.created += created.len();
        self.chunking.advance(settled);
        self.chunking.complete_chunk();

        let overran = budget.is_exceeded();
        if overran {
            self.chunking.shrink();
        }
        if rejected_here > 0 {
            self.chunking.shrink();
            self.status = CreationStatus::Throttled;
        } else if !pressure.is_critical() {
            self.status = CreationStatus::Running;
        }
        self.last_chunk_healthy = !overran && rejected_here == 0;

        debug!(
            chunk = self.chunking.chunks_used(),
            created = created.len(),
            rejected = rejected_here,
            next_size = self.chunking.chunk_size(),
            elapsed_us = budget.elapsed().as_micros() as u64,
            "creation chunk finished"
        );

        if self.remaining() == 0 {
            self.finish();
        }
        Some(created)
    }

    fn create_one(&mut self, item: &Item) -> Result<Created<T>, Outcome> {
        let object = match (self.factory)(item) {
            Ok(object) => object,
            Err(err) => {
                warn!(error = %err, "object factory failed");
                return Err(Outcome::Failed);
            }
        };

        match self
            .registry
            .register_with_state(&object, self.options.initial_state())
        {
            Ok(handle) => Ok(Created { object, handle }),
            Err(RegistryError::RegistrationRejected { reason }) => {
                debug!(%reason, "registration rejected during creation");
                Err(Outcome::Rejected)
            }
            Err(err) => {
                warn!(%err, "registration failed during creation");
                Err(Outcome::Failed)
            }
        }
    }

    fn resize_for(&mut self, pressure: PressureLevel) {
        match pressure {
            PressureLevel::Critical => {
                self.chunking.collapse();
                self.status = CreationStatus::Throttled;
            }
            PressureLevel::Warning => self.chunking.shrink(),
            PressureLevel::Normal | PressureLevel::Unknown => {
                if self.last_chunk_healthy {
                    self.chunking.grow();
                }
            }
        }
    }
}

impl<Item, T, F> CreationRun<Item, T, F> {
    /// Stop the run before its next chunk. Objects already created stay
    /// registered.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn status(&self) -> CreationStatus {
        self.status
    }

    pub fn remaining(&self) -> usize {
        self.pending.len() + self.retry.len()
    }

    pub fn progress(&self) -> CreationProgress {
        CreationProgress {
            created: self.created,
            failed: self.failed,
            rejected: self.rejected,
            remaining: self.remaining(),
            chunk_size: self.chunking.chunk_size() as usize,
            chunks: self.chunking.chunks_used(),
            status: self.status,
        }
    }

    fn finish(&mut self) {
        if !self.status.is_finished() {
            self.status = CreationStatus::Completed;
            info!(
                created = self.created,
                failed = self.failed,
                chunks = self.chunking.chunks_used(),
                "creation run completed"
            );
        }
    }
}

enum Outcome {
    Rejected,
    Failed,
}

impl<Item, T, E, F> Iterator for CreationRun<Item, T, F>
where
    T: ManagedObject + 'static,
    E: fmt::Display,
    F: FnMut(&Item) -> Result<Arc<T>, E>,
{
    type Item = Created<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(created) = self.buffer.pop_front() {
                return Some(created);
            }
            let chunk = self.next_chunk()?;
            self.buffer.extend(chunk);
        }
    }
}

impl<Item, T, F> fmt::Debug for CreationRun<Item, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationRun")
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}
