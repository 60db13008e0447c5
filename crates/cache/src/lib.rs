//! Tilebay Cache Library
//!
//! Bounded preview cache with LRU, LFU, TTL and adaptive eviction, the
//! resource limits shared across the workspace, and the memory pressure
//! monitor that drives eviction and cleanup.

pub mod config;
pub mod key;
pub mod monitor;
pub mod policy;
mod process_memory;
pub mod store;

pub use config::{EvictionPolicy, LimitsError, ResourceLimits, MB};
pub use key::PreviewKey;
pub use monitor::{
    ManualMemory, MemoryMonitor, MemorySource, MemoryStats, MonitorConfig, PressureCallback,
    PressureLevel, ProcessMemory, SamplerHandle, SubscriptionId,
};
pub use policy::AdaptiveMode;
pub use store::{CacheStats, CacheStore, EntryInfo, PutOutcome};
