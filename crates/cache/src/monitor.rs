//! Memory pressure monitoring
//!
//! Samples process memory through a [`MemorySource`], classifies it against
//! the configured [`ResourceLimits`] and notifies subscribers when the pressure
//! level changes. Every sample produces an immutable [`MemoryStats`] snapshot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ResourceLimits, MB};
use crate::process_memory;

/// Memory pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PressureLevel {
    /// Usage below the warning threshold
    Normal,
    /// Usage between the warning and critical thresholds
    Warning,
    /// Usage above the critical threshold
    Critical,
    /// Memory could not be measured
    Unknown,
}

impl PressureLevel {
    /// Classify a usage figure against the budget in `limits`.
    pub fn classify(current_bytes: u64, limits: &ResourceLimits, config: &MonitorConfig) -> Self {
        let budget = limits.max_memory_bytes() as f64;
        if budget <= 0.0 {
            return PressureLevel::Unknown;
        }
        let utilization = current_bytes as f64 / budget;
        if utilization >= config.critical_fraction {
            PressureLevel::Critical
        } else if utilization >= config.warning_fraction {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Returns true for Warning and Critical.
    pub fn needs_relief(&self) -> bool {
        matches!(self, PressureLevel::Warning | PressureLevel::Critical)
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, PressureLevel::Critical)
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
            PressureLevel::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Thresholds and sampling intervals for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Fraction of the budget at which pressure becomes Warning
    pub warning_fraction: f64,
    /// Fraction of the budget at which pressure becomes Critical
    pub critical_fraction: f64,
    /// Sampling interval at Normal or Unknown pressure
    pub normal_interval_ms: u64,
    /// Sampling interval at Warning pressure
    pub warning_interval_ms: u64,
    /// Sampling interval at Critical pressure
    pub critical_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_fraction: 0.75,
            critical_fraction: 0.90,
            normal_interval_ms: 2_000,
            warning_interval_ms: 500,
            critical_interval_ms: 250,
        }
    }
}

impl MonitorConfig {
    /// Set the warning threshold (0.0 to 1.0)
    pub fn with_warning_fraction(mut self, fraction: f64) -> Self {
        self.warning_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set the critical threshold (0.0 to 1.0)
    pub fn with_critical_fraction(mut self, fraction: f64) -> Self {
        self.critical_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set all three sampling intervals
    pub fn with_intervals(mut self, normal: Duration, warning: Duration, critical: Duration) -> Self {
        self.normal_interval_ms = normal.as_millis() as u64;
        self.warning_interval_ms = warning.as_millis() as u64;
        self.critical_interval_ms = critical.as_millis() as u64;
        self
    }

    /// Sampling interval to use after observing `level`.
    pub fn interval_for(&self, level: PressureLevel) -> Duration {
        let ms = match level {
            PressureLevel::Normal | PressureLevel::Unknown => self.normal_interval_ms,
            PressureLevel::Warning => self.warning_interval_ms,
            PressureLevel::Critical => self.critical_interval_ms,
        };
        Duration::from_millis(ms.max(1))
    }

    /// Thresholds must be ordered and within (0, 1].
    pub fn is_valid(&self) -> bool {
        self.warning_fraction > 0.0
            && self.warning_fraction <= self.critical_fraction
            && self.critical_fraction <= 1.0
    }
}

/// Snapshot of one monitor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    /// Resident memory in megabytes (0.0 when unknown)
    pub current_mb: f64,
    /// Highest resident memory seen so far, in megabytes
    pub peak_mb: f64,
    /// Classified pressure level
    pub pressure_level: PressureLevel,
    /// Limits the sample was classified against
    pub limits: ResourceLimits,
    /// When the sample was taken
    pub sampled_at: Instant,
}

impl MemoryStats {
    fn initial(limits: ResourceLimits) -> Self {
        Self {
            current_mb: 0.0,
            peak_mb: 0.0,
            pressure_level: PressureLevel::Normal,
            limits,
            sampled_at: Instant::now(),
        }
    }

    /// Fraction of the memory budget in use, if known.
    pub fn utilization(&self) -> Option<f64> {
        if self.pressure_level == PressureLevel::Unknown || self.limits.max_memory_mb == 0 {
            None
        } else {
            Some(self.current_mb / self.limits.max_memory_mb as f64)
        }
    }
}

/// Something that can report how much memory is in use.
pub trait MemorySource: fmt::Debug + Send + Sync {
    /// Current usage in bytes, or `None` if it cannot be measured.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Resident set size of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemorySource for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        process_memory::current_rss_bytes()
    }
}

/// Manually accounted usage.
///
/// Useful for embedding the monitor over an explicit allocation ledger and for
/// tests that need deterministic pressure.
#[derive(Debug, Default)]
pub struct ManualMemory {
    usage: AtomicU64,
    unavailable: AtomicBool,
}

impl ManualMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_allocation(&self, bytes: u64) {
        self.usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a deallocation
    pub fn record_deallocation(&self, bytes: u64) {
        self.usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Set the usage directly
    pub fn set_usage(&self, bytes: u64) {
        self.usage.store(bytes, Ordering::Relaxed);
    }

    /// Set the usage in megabytes
    pub fn set_usage_mb(&self, mb: u64) {
        self.set_usage(mb.saturating_mul(MB as u64));
    }

    /// Simulate a missing measurement facility
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

impl MemorySource for ManualMemory {
    fn resident_bytes(&self) -> Option<u64> {
        if self.unavailable.load(Ordering::Relaxed) {
            None
        } else {
            Some(self.usage.load(Ordering::Relaxed))
        }
    }
}

/// Callback invoked with `(previous, current)` when the pressure level changes.
pub type PressureCallback = Arc<dyn Fn(PressureLevel, PressureLevel) + Send + Sync>;

/// Identifies a pressure callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct MonitorState {
    last: MemoryStats,
    peak_bytes: u64,
    unavailable_logged: bool,
}

/// Memory monitor
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tilebay_cache::{ManualMemory, MemoryMonitor, MonitorConfig, PressureLevel, ResourceLimits};
///
/// let usage = Arc::new(ManualMemory::new());
/// let monitor = MemoryMonitor::new(
///     usage.clone(),
///     ResourceLimits::default().with_max_memory_mb(100),
///     MonitorConfig::default(),
/// );
///
/// usage.set_usage_mb(95);
/// assert_eq!(monitor.sample().pressure_level, PressureLevel::Critical);
/// ```
pub struct MemoryMonitor {
    source: Arc<dyn MemorySource>,
    config: MonitorConfig,
    limits: RwLock<ResourceLimits>,
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<(SubscriptionId, PressureCallback)>>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("limits", &self.limits())
            .finish_non_exhaustive()
    }
}

impl MemoryMonitor {
    /// Create a monitor over an arbitrary memory source.
    pub fn new(source: Arc<dyn MemorySource>, limits: ResourceLimits, config: MonitorConfig) -> Self {
        Self {
            source,
            config,
            limits: RwLock::new(limits),
            state: Mutex::new(MonitorState {
                last: MemoryStats::initial(limits),
                peak_bytes: 0,
                unavailable_logged: false,
            }),
            callbacks: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Create a monitor over the current process's resident memory.
    pub fn for_process(limits: ResourceLimits, config: MonitorConfig) -> Self {
        Self::new(Arc::new(ProcessMemory), limits, config)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Limits currently used for classification.
    pub fn limits(&self) -> ResourceLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the limits wholesale. Takes effect at the next sample.
    pub fn set_limits(&self, limits: ResourceLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
    }

    /// Take a sample, classify it and notify subscribers on a level change.
    pub fn sample(&self) -> MemoryStats {
        let reading = self.source.resident_bytes();
        let limits = self.limits();
        let now = Instant::now();

        let (stats, previous) = {
            let mut state = self.lock_state();
            let previous = state.last.pressure_level;

            let stats = match reading {
                Some(bytes) => {
                    state.unavailable_logged = false;
                    state.peak_bytes = state.peak_bytes.max(bytes);
                    MemoryStats {
                        current_mb: bytes as f64 / MB as f64,
                        peak_mb: state.peak_bytes as f64 / MB as f64,
                        pressure_level: PressureLevel::classify(bytes, &limits, &self.config),
                        limits,
                        sampled_at: now,
                    }
                }
                None => {
                    if !state.unavailable_logged {
                        warn!("memory sampling unavailable, reporting unknown pressure");
                        state.unavailable_logged = true;
                    }
                    MemoryStats {
                        current_mb: 0.0,
                        peak_mb: state.peak_bytes as f64 / MB as f64,
                        pressure_level: PressureLevel::Unknown,
                        limits,
                        sampled_at: now,
                    }
                }
            };
            state.last = stats;
            (stats, previous)
        };

        if previous != stats.pressure_level {
            info!(
                from = %previous,
                to = %stats.pressure_level,
                current_mb = stats.current_mb,
                budget_mb = limits.max_memory_mb,
                "memory pressure changed"
            );
            self.notify(previous, stats.pressure_level);
        }

        stats
    }

    /// The most recent sample, without sampling again.
    pub fn last_stats(&self) -> MemoryStats {
        self.lock_state().last
    }

    /// Pressure level of the most recent sample.
    pub fn pressure(&self) -> PressureLevel {
        self.lock_state().last.pressure_level
    }

    /// How long to wait before the next sample, based on the last level.
    pub fn next_interval(&self) -> Duration {
        self.config.interval_for(self.pressure())
    }

    /// Register a callback for pressure level changes.
    ///
    /// Callbacks run on whichever thread called [`sample`](Self::sample), after
    /// the monitor's own locks are released.
    pub fn on_pressure_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(PressureLevel, PressureLevel) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_callbacks().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns true if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.lock_callbacks();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Start a background thread that samples at the adaptive interval.
    pub fn spawn_sampler(self: &Arc<Self>) -> std::io::Result<SamplerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let monitor = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("tilebay-memory-sampler".to_string())
            .spawn(move || loop {
                monitor.sample();
                match stop_rx.recv_timeout(monitor.next_interval()) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!("memory sampler started");
        Ok(SamplerHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn notify(&self, previous: PressureLevel, current: PressureLevel) {
        let callbacks: Vec<PressureCallback> = self
            .lock_callbacks()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(previous, current);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<(SubscriptionId, PressureCallback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running sampler thread. Dropping it stops the thread without
/// waiting for it.
#[derive(Debug)]
pub struct SamplerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Stop the sampler and wait for its thread to exit.
    pub fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("memory sampler thread panicked");
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn monitor_with(limit_mb: usize) -> (MemoryMonitor, Arc<ManualMemory>) {
        let usage = Arc::new(ManualMemory::new());
        let monitor = MemoryMonitor::new(
            usage.clone(),
            ResourceLimits::default().with_max_memory_mb(limit_mb),
            MonitorConfig::default(),
        );
        (monitor, usage)
    }

    #[test]
    fn test_pressure_levels() {
        let limits = ResourceLimits::default().with_max_memory_mb(100);
        let config = MonitorConfig::default();
        let mb = MB as u64;

        assert_eq!(PressureLevel::classify(30 * mb, &limits, &config), PressureLevel::Normal);
        assert_eq!(PressureLevel::classify(80 * mb, &limits, &config), PressureLevel::Warning);
        assert_eq!(PressureLevel::classify(95 * mb, &limits, &config), PressureLevel::Critical);
    }

    #[test]
    fn test_pressure_needs_relief() {
        assert!(!PressureLevel::Normal.needs_relief());
        assert!(!PressureLevel::Unknown.needs_relief());
        assert!(PressureLevel::Warning.needs_relief());
        assert!(PressureLevel::Critical.needs_relief());
    }

    #[test]
    fn test_config_builders_clamp() {
        let config = MonitorConfig::default()
            .with_warning_fraction(1.5)
            .with_critical_fraction(-1.0);
        assert_eq!(config.warning_fraction, 1.0);
        assert_eq!(config.critical_fraction, 0.0);
        assert!(!config.is_valid());
        assert!(MonitorConfig::default().is_valid());
    }

    #[test]
    fn test_sample_tracks_peak() {
        let (monitor, usage) = monitor_with(100);

        usage.set_usage_mb(40);
        let stats = monitor.sample();
        assert_eq!(stats.current_mb, 40.0);
        assert_eq!(stats.peak_mb, 40.0);

        usage.set_usage_mb(10);
        let stats = monitor.sample();
        assert_eq!(stats.current_mb, 10.0);
        assert_eq!(stats.peak_mb, 40.0);
        assert_eq!(stats.utilization(), Some(0.1));
    }

    #[test]
    fn test_unavailable_source_reports_unknown() {
        let (monitor, usage) = monitor_with(100);
        usage.set_unavailable(true);

        let stats = monitor.sample();
        assert_eq!(stats.pressure_level, PressureLevel::Unknown);
        assert_eq!(stats.utilization(), None);

        // Repeated failures keep degrading quietly.
        assert_eq!(monitor.sample().pressure_level, PressureLevel::Unknown);

        usage.set_unavailable(false);
        usage.set_usage_mb(1);
        assert_eq!(monitor.sample().pressure_level, PressureLevel::Normal);
    }

    #[test]
    fn test_callbacks_fire_only_on_change() {
        let (monitor, usage) = monitor_with(100);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        monitor.on_pressure_change(move |from, to| sink.lock().unwrap().push((from, to)));

        usage.set_usage_mb(10);
        monitor.sample();
        usage.set_usage_mb(80);
        monitor.sample();
        monitor.sample();
        usage.set_usage_mb(99);
        monitor.sample();

        let changes = changes.lock().unwrap();
        assert_eq!(
            *changes,
            vec![
                (PressureLevel::Normal, PressureLevel::Warning),
                (PressureLevel::Warning, PressureLevel::Critical),
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let (monitor, usage) = monitor_with(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = monitor.on_pressure_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.unsubscribe(id));
        assert!(!monitor.unsubscribe(id));

        usage.set_usage_mb(99);
        monitor.sample();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interval_shrinks_under_pressure() {
        let (monitor, usage) = monitor_with(100);

        usage.set_usage_mb(10);
        monitor.sample();
        let normal = monitor.next_interval();

        usage.set_usage_mb(80);
        monitor.sample();
        let warning = monitor.next_interval();

        usage.set_usage_mb(95);
        monitor.sample();
        let critical = monitor.next_interval();

        assert!(warning < normal);
        assert!(critical < warning);
    }

    #[test]
    fn test_set_limits_reclassifies() {
        let (monitor, usage) = monitor_with(100);
        usage.set_usage_mb(50);
        assert_eq!(monitor.sample().pressure_level, PressureLevel::Normal);

        monitor.set_limits(monitor.limits().with_max_memory_mb(52));
        let stats = monitor.sample();
        assert_eq!(stats.pressure_level, PressureLevel::Critical);
        assert_eq!(stats.limits.max_memory_mb, 52);
    }

    #[test]
    fn test_manual_memory_accounting() {
        let usage = ManualMemory::new();
        usage.record_allocation(100);
        usage.record_deallocation(30);
        assert_eq!(usage.resident_bytes(), Some(70));
        usage.record_deallocation(1_000);
        assert_eq!(usage.resident_bytes(), Some(0));
    }

    #[test]
    fn test_sampler_thread_samples_and_stops() {
        let usage = Arc::new(ManualMemory::new());
        let monitor = Arc::new(MemoryMonitor::new(
            usage.clone(),
            ResourceLimits::default().with_max_memory_mb(100),
            MonitorConfig::default().with_intervals(
                Duration::from_millis(5),
                Duration::from_millis(5),
                Duration::from_millis(5),
            ),
        ));
        usage.set_usage_mb(95);

        let sampler = monitor.spawn_sampler().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.pressure() != PressureLevel::Critical && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        sampler.shutdown();

        assert_eq!(monitor.pressure(), PressureLevel::Critical);
    }

    #[test]
    fn test_process_monitor_does_not_panic() {
        let monitor = MemoryMonitor::for_process(ResourceLimits::default(), MonitorConfig::default());
        let stats = monitor.sample();
        assert!(stats.current_mb >= 0.0);
    }
}
