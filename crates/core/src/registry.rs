//! Registry of live managed objects and background workers
//!
//! The UI owns every tile-like object; the registry only observes them
//! through `Weak` references. Each object carries a state (active, idle,
//! disposed) and a generation that changes on every transition. Cleanup
//! reclaims idle objects with a compare-and-swap on the combined
//! state/generation word, so an object touched after cleanup took its
//! snapshot is skipped instead of being disposed under the UI's feet.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tilebay_cache::{
    LimitsError, MemoryMonitor, MemoryStats, MonitorConfig, PressureLevel, ResourceLimits,
};
use tilebay_scheduler::CancellationToken;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult, RejectReason};
use crate::workers::{WorkerId, WorkerInfo, WorkerPermit, WorkerTable};

/// Workers younger than this survive aggressive cleanup.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(30);

/// Something the registry can track and reclaim
///
/// Implemented by the UI's tile objects. The registry never drops an object;
/// reclaiming means calling `dispose` so the object can release its decoded
/// image, textures and similar resources.
pub trait ManagedObject: Send + Sync {
    /// Release resources. Called at most once, never while the object is
    /// active, and never with a registry lock held.
    fn dispose(&self);

    /// Bytes this object keeps alive, counted against the memory budget.
    fn memory_estimate(&self) -> usize {
        0
    }
}

/// Identifier assigned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    /// In use by the UI; never reclaimed
    Active,
    /// Registered but not in use; eligible for cleanup
    Idle,
    /// Disposed or unregistered; terminal
    Disposed,
}

impl ObjectState {
    const fn bits(self) -> u64 {
        match self {
            ObjectState::Active => 0,
            ObjectState::Idle => 1,
            ObjectState::Disposed => 2,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => ObjectState::Active,
            1 => ObjectState::Idle,
            _ => ObjectState::Disposed,
        }
    }
}

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// State and generation packed into one word: `generation << 2 | state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotWord(u64);

impl SlotWord {
    fn new(generation: u64, state: ObjectState) -> Self {
        Self((generation << STATE_BITS) | state.bits())
    }

    fn state(self) -> ObjectState {
        ObjectState::from_bits(self.0)
    }

    fn generation(self) -> u64 {
        self.0 >> STATE_BITS
    }

    fn advance(self, state: ObjectState) -> Self {
        Self::new(self.generation().wrapping_add(1), state)
    }
}

#[derive(Debug)]
struct HandleSlot {
    word: AtomicU64,
}

impl HandleSlot {
    fn new(state: ObjectState) -> Self {
        Self {
            word: AtomicU64::new(SlotWord::new(0, state).0),
        }
    }

    fn load(&self) -> SlotWord {
        SlotWord(self.word.load(Ordering::Acquire))
    }

    /// Move to `target` unless already disposed, bumping the generation.
    fn transition(&self, target: ObjectState) -> Result<SlotWord, SlotWord> {
        let mut current = self.load();
        loop {
            if current.state() == ObjectState::Disposed {
                return Err(current);
            }
            let next = current.advance(target);
            match self.word.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = SlotWord(actual),
            }
        }
    }

    /// Dispose only if the word is exactly `expected` (idle, same generation).
    fn try_dispose(&self, expected: SlotWord) -> bool {
        self.word
            .compare_exchange(
                expected.0,
                expected.advance(ObjectState::Disposed).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn force_disposed(&self) {
        let mut current = self.load();
        while current.state() != ObjectState::Disposed {
            match self.word.compare_exchange_weak(
                current.0,
                current.advance(ObjectState::Disposed).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = SlotWord(actual),
            }
        }
    }
}

/// Non-owning handle to a registered object
///
/// Cheap to clone. State changes go through the registry
/// ([`ResourceRegistry::mark_active`], [`ResourceRegistry::mark_idle`]).
#[derive(Clone)]
pub struct ManagedObjectHandle {
    id: ObjectId,
    object: Weak<dyn ManagedObject>,
    slot: Arc<HandleSlot>,
}

impl ManagedObjectHandle {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn state(&self) -> ObjectState {
        self.slot.load().state()
    }

    /// Changes on every state transition.
    pub fn generation(&self) -> u64 {
        self.slot.load().generation()
    }

    /// The object, if its owner still holds it.
    pub fn upgrade(&self) -> Option<Arc<dyn ManagedObject>> {
        self.object.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }
}

impl fmt::Debug for ManagedObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.slot.load();
        f.debug_struct("ManagedObjectHandle")
            .field("id", &self.id)
            .field("state", &word.state())
            .field("generation", &word.generation())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Deferred cleanup requested from a pressure callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupRequest {
    Standard,
    Aggressive,
}

impl CleanupRequest {
    pub fn is_aggressive(&self) -> bool {
        matches!(self, CleanupRequest::Aggressive)
    }

    /// The cleanup a pressure level calls for, if any.
    pub fn for_level(level: PressureLevel) -> Option<Self> {
        match level {
            PressureLevel::Warning => Some(CleanupRequest::Standard),
            PressureLevel::Critical => Some(CleanupRequest::Aggressive),
            PressureLevel::Normal | PressureLevel::Unknown => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            CleanupRequest::Standard => 1,
            CleanupRequest::Aggressive => 2,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(CleanupRequest::Standard),
            2 => Some(CleanupRequest::Aggressive),
            _ => None,
        }
    }
}

/// Objects by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub active: usize,
    pub idle: usize,
}

impl ObjectCounts {
    pub fn total(&self) -> usize {
        self.active + self.idle
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub objects: ObjectCounts,
    /// Sum of memory estimates of registered objects
    pub tracked_bytes: usize,
    pub registered: u64,
    pub rejected: u64,
    /// Objects disposed by cleanup
    pub reclaimed: u64,
    /// Idle objects skipped because they were touched after the snapshot
    pub skipped: u64,
    /// Entries dropped because their owner released the object
    pub pruned: u64,
    pub cleanups: u64,
    pub active_workers: usize,
    pub peak_workers: usize,
    pub workers_admitted: u64,
    pub workers_rejected: u64,
    pub workers_cancelled: u64,
}

struct Entry {
    handle: ManagedObjectHandle,
    estimate: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ObjectId, Entry>,
    tracked_bytes: usize,
    registered: u64,
    rejected: u64,
    reclaimed: u64,
    skipped: u64,
    pruned: u64,
    cleanups: u64,
    workers_cancelled: u64,
}

impl RegistryState {
    fn remove(&mut self, id: ObjectId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.tracked_bytes = self.tracked_bytes.saturating_sub(entry.estimate);
        Some(entry)
    }
}

/// Registry of live managed objects and workers
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tilebay_cache::ResourceLimits;
/// use tilebay_core::{ManagedObject, ObjectState, ResourceRegistry};
///
/// struct Tile;
/// impl ManagedObject for Tile {
///     fn dispose(&self) {}
/// }
///
/// let registry = ResourceRegistry::with_limits(ResourceLimits::default());
/// let tile = Arc::new(Tile);
/// let handle = registry.register(&tile).unwrap();
/// assert_eq!(handle.state(), ObjectState::Active);
///
/// registry.mark_idle(&handle).unwrap();
/// assert_eq!(registry.perform_cleanup(false), 1);
/// assert_eq!(handle.state(), ObjectState::Disposed);
/// ```
pub struct ResourceRegistry {
    limits: RwLock<ResourceLimits>,
    monitor: Arc<MemoryMonitor>,
    state: Mutex<RegistryState>,
    workers: Arc<WorkerTable>,
    next_id: AtomicU64,
    cleanup_request: AtomicU8,
    worker_grace: Duration,
}

static GLOBAL_REGISTRY: OnceLock<Arc<ResourceRegistry>> = OnceLock::new();

impl ResourceRegistry {
    pub fn new(limits: ResourceLimits, monitor: Arc<MemoryMonitor>) -> Self {
        Self {
            limits: RwLock::new(limits),
            monitor,
            state: Mutex::new(RegistryState::default()),
            workers: Arc::new(WorkerTable::new(limits.max_concurrent_workers)),
            next_id: AtomicU64::new(1),
            cleanup_request: AtomicU8::new(0),
            worker_grace: DEFAULT_WORKER_GRACE,
        }
    }

    /// Registry backed by a monitor over this process's memory.
    pub fn with_limits(limits: ResourceLimits) -> Self {
        let monitor = MemoryMonitor::for_process(limits, MonitorConfig::default());
        Self::new(limits, Arc::new(monitor))
    }

    /// How long a worker may run before aggressive cleanup cancels it.
    pub fn with_worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = grace;
        self
    }

    /// Process-wide registry, created with default limits on first use
    /// unless [`install_global`](Self::install_global) ran first.
    pub fn global() -> &'static Arc<ResourceRegistry> {
        GLOBAL_REGISTRY.get_or_init(|| Arc::new(Self::with_limits(ResourceLimits::default())))
    }

    /// Install a configured registry as the global one. Fails, handing the
    /// registry back, if a global registry already exists.
    pub fn install_global(registry: Arc<ResourceRegistry>) -> Result<(), Arc<ResourceRegistry>> {
        GLOBAL_REGISTRY.set(registry)
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn limits(&self) -> ResourceLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the limits. Objects above a lowered limit stay registered;
    /// new registrations are refused until cleanup brings counts down.
    pub fn set_limits(&self, limits: ResourceLimits) -> Result<(), LimitsError> {
        limits.validate()?;
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
        self.monitor.set_limits(limits);
        self.workers.set_limit(limits.max_concurrent_workers);
        info!(
            max_objects = limits.max_objects,
            max_memory_mb = limits.max_memory_mb,
            max_workers = limits.max_concurrent_workers,
            "registry limits updated"
        );
        Ok(())
    }

    /// Register an object as active.
    pub fn register<T>(&self, object: &Arc<T>) -> RegistryResult<ManagedObjectHandle>
    where
        T: ManagedObject + 'static,
    {
        self.register_with_state(object, ObjectState::Active)
    }

    /// Register an object in the given initial state (`Active` or `Idle`).
    pub fn register_with_state<T>(
        &self,
        object: &Arc<T>,
        initial: ObjectState,
    ) -> RegistryResult<ManagedObjectHandle>
    where
        T: ManagedObject + 'static,
    {
        let weak: Weak<dyn ManagedObject> = Arc::downgrade(object) as Weak<T>;
        self.register_weak(weak, object.memory_estimate(), initial)
    }

    fn register_weak(
        &self,
        object: Weak<dyn ManagedObject>,
        estimate: usize,
        initial: ObjectState,
    ) -> RegistryResult<ManagedObjectHandle> {
        if object.strong_count() == 0 {
            return Err(RegistryError::ObjectDropped);
        }
        let initial = match initial {
            ObjectState::Disposed => ObjectState::Idle,
            state => state,
        };
        let limits = self.limits();
        let pressure = self.monitor.pressure();

        let mut state = self.lock();
        if let Err(reason) = Self::admission(&state, &limits, pressure, estimate) {
            state.rejected += 1;
            drop(state);
            debug!(%reason, "registration rejected");
            return Err(RegistryError::RegistrationRejected { reason });
        }

        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ManagedObjectHandle {
            id,
            object,
            slot: Arc::new(HandleSlot::new(initial)),
        };
        state.entries.insert(
            id,
            Entry {
                handle: handle.clone(),
                estimate,
            },
        );
        state.tracked_bytes += estimate;
        state.registered += 1;
        Ok(handle)
    }

    fn admission(
        state: &RegistryState,
        limits: &ResourceLimits,
        pressure: PressureLevel,
        estimate: usize,
    ) -> Result<(), RejectReason> {
        if pressure.is_critical() {
            return Err(RejectReason::CriticalPressure);
        }
        if limits.exceeds_object_limit(state.entries.len() + 1) {
            return Err(RejectReason::ObjectLimit {
                limit: limits.max_objects,
            });
        }
        let available = limits.max_memory_bytes().saturating_sub(state.tracked_bytes);
        if estimate > available {
            return Err(RejectReason::MemoryLimit {
                requested: estimate,
                available,
            });
        }
        Ok(())
    }

    /// Forget an object without disposing it, e.g. after the UI destroyed it
    /// itself. The handle becomes disposed.
    pub fn unregister(&self, handle: &ManagedObjectHandle) -> bool {
        let removed = self.lock().remove(handle.id).is_some();
        handle.slot.force_disposed();
        removed
    }

    /// Mark an object as in use. Fails if it has been disposed.
    pub fn mark_active(&self, handle: &ManagedObjectHandle) -> RegistryResult<()> {
        handle
            .slot
            .transition(ObjectState::Active)
            .map(|_| ())
            .map_err(|_| RegistryError::Disposed(handle.id))
    }

    /// Mark an object as no longer in use, making it eligible for cleanup.
    pub fn mark_idle(&self, handle: &ManagedObjectHandle) -> RegistryResult<()> {
        handle
            .slot
            .transition(ObjectState::Idle)
            .map(|_| ())
            .map_err(|_| RegistryError::Disposed(handle.id))
    }

    /// Reclaim idle objects, returning how many were disposed.
    ///
    /// Idle handles are snapshotted under the lock; each is then disposed
    /// only if its state and generation are unchanged since the snapshot.
    /// `aggressive` also prunes entries whose owner dropped the object,
    /// shrinks internal tables and cancels workers past their grace period.
    pub fn perform_cleanup(&self, aggressive: bool) -> usize {
        let snapshot = self.idle_snapshot();
        let (reclaimed, skipped) = self.reclaim(snapshot);

        let mut state = self.lock();
        let pruned = if aggressive { Self::prune_dead(&mut state) } else { 0 };
        if aggressive {
            state.entries.shrink_to_fit();
        }
        state.cleanups += 1;
        drop(state);

        let cancelled = if aggressive {
            self.workers.cancel_older_than(self.worker_grace)
        } else {
            0
        };
        if cancelled > 0 {
            self.lock().workers_cancelled += cancelled as u64;
        }

        if aggressive {
            info!(reclaimed, skipped, pruned, cancelled, "aggressive cleanup finished");
        } else if reclaimed > 0 || skipped > 0 {
            debug!(reclaimed, skipped, "cleanup finished");
        }
        reclaimed
    }

    fn idle_snapshot(&self) -> Vec<(ManagedObjectHandle, SlotWord)> {
        self.lock()
            .entries
            .values()
            .filter_map(|entry| {
                let word = entry.handle.slot.load();
                (word.state() == ObjectState::Idle).then(|| (entry.handle.clone(), word))
            })
            .collect()
    }

    fn reclaim(&self, snapshot: Vec<(ManagedObjectHandle, SlotWord)>) -> (usize, usize) {
        let mut disposed = Vec::new();
        let mut skipped = 0;
        for (handle, word) in snapshot {
            if handle.slot.try_dispose(word) {
                if let Some(object) = handle.upgrade() {
                    object.dispose();
                }
                disposed.push(handle.id);
            } else {
                skipped += 1;
            }
        }

        let reclaimed = disposed.len();
        let mut state = self.lock();
        for id in disposed {
            state.remove(id);
        }
        state.reclaimed += reclaimed as u64;
        state.skipped += skipped as u64;
        (reclaimed, skipped)
    }

    fn prune_dead(state: &mut RegistryState) -> usize {
        let dead: Vec<ObjectId> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.handle.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            if let Some(entry) = state.remove(*id) {
                entry.handle.slot.force_disposed();
            }
        }
        state.pruned += dead.len() as u64;
        dead.len()
    }

    /// Ask the consumer to run cleanup at its next tick. Safe to call from
    /// pressure callbacks on any thread; a pending aggressive request is
    /// never downgraded.
    pub fn request_cleanup(&self, level: PressureLevel) -> bool {
        match CleanupRequest::for_level(level) {
            Some(request) => {
                self.cleanup_request.fetch_max(request.bits(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Take and clear the pending cleanup request.
    pub fn take_cleanup_request(&self) -> Option<CleanupRequest> {
        CleanupRequest::from_bits(self.cleanup_request.swap(0, Ordering::AcqRel))
    }

    /// Sample memory now.
    pub fn memory_usage(&self) -> MemoryStats {
        self.monitor.sample()
    }

    pub fn state(&self, id: ObjectId) -> Option<ObjectState> {
        self.lock().entries.get(&id).map(|entry| entry.handle.state())
    }

    pub fn handle(&self, id: ObjectId) -> Option<ManagedObjectHandle> {
        self.lock().entries.get(&id).map(|entry| entry.handle.clone())
    }

    /// The object behind `id`, if registered and still alive.
    pub fn object(&self, id: ObjectId) -> Option<Arc<dyn ManagedObject>> {
        self.handle(id).and_then(|handle| handle.upgrade())
    }

    pub fn counts(&self) -> ObjectCounts {
        let state = self.lock();
        let mut counts = ObjectCounts::default();
        for entry in state.entries.values() {
            match entry.handle.state() {
                ObjectState::Active => counts.active += 1,
                ObjectState::Idle => counts.idle += 1,
                ObjectState::Disposed => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let objects = self.counts();
        let workers = self.workers.counters();
        let state = self.lock();
        RegistryStats {
            objects,
            tracked_bytes: state.tracked_bytes,
            registered: state.registered,
            rejected: state.rejected,
            reclaimed: state.reclaimed,
            skipped: state.skipped,
            pruned: state.pruned,
            cleanups: state.cleanups,
            active_workers: workers.active,
            peak_workers: workers.peak,
            workers_admitted: workers.admitted,
            workers_rejected: workers.rejected,
            workers_cancelled: state.workers_cancelled,
        }
    }

    /// Admit a background worker, blocking while `max_concurrent_workers`
    /// are already running.
    pub fn register_worker(&self, name: impl Into<String>, token: CancellationToken) -> WorkerPermit {
        self.workers.admit_blocking(name.into(), token)
    }

    /// Admit a background worker, waiting at most `timeout` for a slot.
    pub fn register_worker_timeout(
        &self,
        name: impl Into<String>,
        token: CancellationToken,
        timeout: Duration,
    ) -> RegistryResult<WorkerPermit> {
        self.workers.admit_within(name.into(), token, timeout)
    }

    /// Admit a background worker only if a slot is free right now.
    pub fn try_register_worker(
        &self,
        name: impl Into<String>,
        token: CancellationToken,
    ) -> RegistryResult<WorkerPermit> {
        self.workers.admit_within(name.into(), token, Duration::ZERO)
    }

    /// Release a worker slot early. Dropping the permit does the same.
    pub fn unregister_worker(&self, permit: WorkerPermit) -> WorkerId {
        let id = permit.id();
        drop(permit);
        id
    }

    pub fn active_workers(&self) -> usize {
        self.workers.active()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("limits", &self.limits())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
