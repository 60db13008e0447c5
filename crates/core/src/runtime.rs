//! Runtime context wiring the subsystems together
//!
//! A [`TileRuntime`] owns one monitor, registry, scheduler and UI batch built
//! from a [`RuntimeConfig`]. Pressure changes are routed to every attached
//! cache (evicted immediately, on the sampling thread) and to the registry
//! (recorded as a cleanup request and carried out by the next
//! [`tick`](TileRuntime::tick) on the consumer thread).

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tilebay_cache::{
    CacheStore, MemoryMonitor, MemorySource, MemoryStats, PressureLevel, ProcessMemory,
    ResourceLimits, SamplerHandle, SubscriptionId,
};
use tilebay_scheduler::{DrainedTask, TaskScheduler, UpdateBatch};
use tracing::{debug, info};

use crate::config::{ConfigError, RuntimeConfig};
use crate::creation::BatchCreationController;
use crate::producer::{ProducerPool, ProducerPoolConfig};
use crate::registry::ResourceRegistry;

type LimitsListener = Box<dyn Fn(ResourceLimits) + Send + Sync>;

/// What one consumer tick did
pub struct TickReport<T> {
    /// Tasks run or settled during the tick, in drain order
    pub tasks: Vec<DrainedTask<T>>,
    /// Objects disposed by the cleanup this tick carried out
    pub reclaimed: usize,
    /// UI mutations applied by the batch flush
    pub applied: usize,
    pub pressure: PressureLevel,
    /// Memory is critical; callers should hold off on new work
    pub throttled: bool,
}

impl<T> fmt::Debug for TickReport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickReport")
            .field("tasks", &self.tasks.len())
            .field("reclaimed", &self.reclaimed)
            .field("applied", &self.applied)
            .field("pressure", &self.pressure)
            .field("throttled", &self.throttled)
            .finish()
    }
}

/// Shared context for one application instance
///
/// # Example
///
/// ```
/// use tilebay_core::{RuntimeConfig, TileRuntime};
/// use tilebay_scheduler::TaskPriority;
///
/// let runtime: TileRuntime<String> = TileRuntime::new(RuntimeConfig::default()).unwrap();
/// let previews = runtime.cache::<String, Vec<u8>>();
///
/// runtime
///     .scheduler()
///     .submit_fn(TaskPriority::Visible, |_| "tile ready".to_string());
///
/// let report = runtime.tick();
/// assert_eq!(report.tasks.len(), 1);
/// assert!(previews.is_empty());
/// ```
pub struct TileRuntime<T> {
    config: RuntimeConfig,
    monitor: Arc<MemoryMonitor>,
    registry: Arc<ResourceRegistry>,
    scheduler: Arc<TaskScheduler<T>>,
    batch: Arc<UpdateBatch>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    limits_listeners: Mutex<Vec<LimitsListener>>,
}

impl<T> TileRuntime<T> {
    /// Runtime sampling this process's resident memory.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        Self::with_memory_source(config, Arc::new(ProcessMemory))
    }

    pub fn with_memory_source(
        config: RuntimeConfig,
        source: Arc<dyn MemorySource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let monitor = Arc::new(MemoryMonitor::new(source, config.limits, config.monitor));
        let mut registry = ResourceRegistry::new(config.limits, monitor.clone());
        if let Some(grace) = config.worker_grace() {
            registry = registry.with_worker_grace(grace);
        }
        let registry = Arc::new(registry);

        let weak: Weak<ResourceRegistry> = Arc::downgrade(&registry);
        let subscription = monitor.on_pressure_change(move |_, current| {
            if let Some(registry) = weak.upgrade() {
                registry.request_cleanup(current);
            }
        });

        info!(
            max_objects = config.limits.max_objects,
            max_memory_mb = config.limits.max_memory_mb,
            max_workers = config.limits.max_concurrent_workers,
            policy = %config.cache_policy,
            "tile runtime started"
        );

        Ok(Self {
            scheduler: Arc::new(TaskScheduler::with_config(config.scheduler)),
            batch: Arc::new(UpdateBatch::new(config.batch)),
            config,
            monitor,
            registry,
            subscriptions: Mutex::new(vec![subscription]),
            limits_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler<T>> {
        &self.scheduler
    }

    pub fn batch(&self) -> &Arc<UpdateBatch> {
        &self.batch
    }

    /// A new cache with the configured limits and policy, attached to the
    /// monitor.
    pub fn cache<K, V>(&self) -> CacheStore<K, V>
    where
        K: Eq + Hash + Clone + Send + 'static,
        V: Send + 'static,
    {
        let cache = CacheStore::new(self.registry.limits(), self.config.cache_policy);
        self.attach_cache(&cache);
        cache
    }

    /// Evict from `cache` on pressure changes and resize it on `set_limits`.
    pub fn attach_cache<K, V>(&self, cache: &CacheStore<K, V>) -> SubscriptionId
    where
        K: Eq + Hash + Clone + Send + 'static,
        V: Send + 'static,
    {
        let relieved = cache.clone();
        let id = self.monitor.on_pressure_change(move |_, current| {
            relieved.relieve_pressure(current);
        });
        lock(&self.subscriptions).push(id);

        let resized = cache.clone();
        lock(&self.limits_listeners).push(Box::new(move |limits| {
            resized.set_limits(limits);
        }));
        id
    }

    pub fn creation_controller(&self) -> BatchCreationController {
        BatchCreationController::new(self.registry.clone(), self.config.creation)
    }

    /// Start a sampler thread that drives pressure callbacks.
    pub fn spawn_sampler(&self) -> std::io::Result<SamplerHandle> {
        self.monitor.spawn_sampler()
    }

    /// Sample memory now, firing pressure callbacks on a level change.
    pub fn sample(&self) -> MemoryStats {
        self.monitor.sample()
    }

    /// Swap limits on the registry, monitor, worker table and every attached
    /// cache.
    pub fn set_limits(&self, limits: ResourceLimits) -> Result<(), ConfigError> {
        self.registry.set_limits(limits)?;
        for listener in lock(&self.limits_listeners).iter() {
            listener(limits);
        }
        Ok(())
    }

    /// One consumer tick: pending cleanup, a bounded drain and a batch flush.
    ///
    /// Samples memory first when the last sample is older than the monitor's
    /// current interval, so a runtime without a sampler thread still reacts
    /// to pressure.
    pub fn tick(&self) -> TickReport<T> {
        if self.monitor.last_stats().sampled_at.elapsed() >= self.monitor.next_interval() {
            self.monitor.sample();
        }

        let reclaimed = match self.registry.take_cleanup_request() {
            Some(request) => self.registry.perform_cleanup(request.is_aggressive()),
            None => 0,
        };

        let drain = self.config.drain;
        let tasks = self.scheduler.drain(drain.max_items, drain.max_duration());
        let applied = self.batch.flush_if_due();
        let pressure = self.monitor.pressure();

        if reclaimed > 0 {
            debug!(reclaimed, %pressure, "tick reclaimed idle objects");
        }

        TickReport {
            tasks,
            reclaimed,
            applied,
            pressure,
            throttled: pressure.is_critical(),
        }
    }
}

impl<T: Send + 'static> TileRuntime<T> {
    /// Start producer threads feeding this runtime's scheduler.
    pub fn spawn_producers(&self, config: ProducerPoolConfig) -> std::io::Result<ProducerPool<T>> {
        ProducerPool::new(self.registry.clone(), self.scheduler.clone(), config)
    }
}

impl<T> Drop for TileRuntime<T> {
    fn drop(&mut self) {
        for id in lock(&self.subscriptions).drain(..) {
            self.monitor.unsubscribe(id);
        }
    }
}

impl<T> fmt::Debug for TileRuntime<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileRuntime")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler.stats())
            .field("batch", &self.batch.stats())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
