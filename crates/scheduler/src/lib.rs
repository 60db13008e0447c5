//! Tilebay Scheduler Library
//!
//! Priority task scheduling for work that must land on the UI thread.
//!
//! Producers on any thread submit tasks tagged with a priority (immediate,
//! visible, margin, prefetch, idle). The UI thread drains the queue once per
//! tick under an item and time budget. Tasks support cooperative
//! cancellation, timeouts measured from enqueue, and keyed trailing debounce.
//! `UpdateBatch` coalesces UI mutations pushed from producer threads.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tilebay_scheduler::{Task, TaskPriority, TaskScheduler, TaskStatus};
//!
//! let scheduler = TaskScheduler::new();
//!
//! let tile = scheduler.submit(
//!     Task::new(TaskPriority::Visible, |token| {
//!         if token.is_cancelled() {
//!             return None;
//!         }
//!         Some((0u32, 0u32))
//!     })
//!     .with_timeout(Duration::from_millis(500)),
//! );
//!
//! // Collapse a burst of zoom events into one re-layout.
//! for level in 1..=5u32 {
//!     scheduler.debounce(
//!         "zoom",
//!         Task::new(TaskPriority::Immediate, move |_| Some((level, level))),
//!         Duration::from_millis(50),
//!     );
//! }
//!
//! // Once per UI tick:
//! for done in scheduler.drain(32, Duration::from_millis(8)) {
//!     if let Ok(Some(position)) = done.outcome {
//!         let _ = position;
//!     }
//! }
//! assert_eq!(tile.status(), TaskStatus::Completed);
//! ```

mod batch;
mod cancel;
mod debounce;
pub mod frame_budget;
mod priority;
mod scheduler;
mod task;

// Re-export public API
pub use batch::{BatchStats, BatchTrigger, UiMutation, UpdateBatch};
pub use cancel::CancellationToken;
pub use frame_budget::{ChunkedOperation, SliceBudget};
pub use priority::{TaskId, TaskPriority};
pub use scheduler::{SchedulerConfig, SchedulerStats, TaskScheduler};
pub use task::{DrainedTask, Task, TaskError, TaskHandle, TaskOutcome, TaskPayload, TaskStatus};
