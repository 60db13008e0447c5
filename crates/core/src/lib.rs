//! Tilebay Core Library
//!
//! Lifetime and admission control for tile-like objects shown in a large
//! scrolling grid.
//!
//! The [`ResourceRegistry`] observes every live tile through a weak handle and
//! disposes idle ones when memory runs short, never touching tiles the UI
//! marked active. It also admits background workers up to a concurrency
//! limit. [`BatchCreationController`] registers thousands of new tiles in
//! chunks sized to current pressure, and [`TileRuntime`] wires the registry,
//! caches, scheduler and monitor together from one [`RuntimeConfig`].

pub mod config;
pub mod creation;
pub mod error;
pub mod producer;
pub mod registry;
pub mod runtime;
mod workers;

pub use config::{ConfigError, DrainConfig, RuntimeConfig};
pub use creation::{
    BatchCreationController, Created, CreationOptions, CreationProgress, CreationRun,
    CreationStatus,
};
pub use error::{RegistryError, RegistryResult, RejectReason};
pub use producer::{ProducerJob, ProducerPool, ProducerPoolConfig, ProducerStats};
pub use registry::{
    CleanupRequest, ManagedObject, ManagedObjectHandle, ObjectCounts, ObjectId, ObjectState,
    RegistryStats, ResourceRegistry, DEFAULT_WORKER_GRACE,
};
pub use runtime::{TickReport, TileRuntime};
pub use workers::{WorkerId, WorkerInfo, WorkerPermit};
