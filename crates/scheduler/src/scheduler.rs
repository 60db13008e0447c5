//! Task scheduler
//!
//! Producers on any thread submit tasks; the UI thread calls `drain` once per
//! tick to run as many as fit in the tick's item and time budget. Payloads
//! run only inside `drain`, on the calling thread, so everything they touch
//! is owned by the consumer.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::debounce::DebounceTable;
use crate::frame_budget::SliceBudget;
use crate::priority::{QueueKey, ReadyQueue, TaskId, TaskPriority};
use crate::task::{DrainedTask, QueuedTask, Task, TaskError, TaskHandle, TaskStatus};
use crate::CancellationToken;

/// Scheduler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ready tasks held at once. When full, the least urgent task is dropped.
    pub max_queue_depth: usize,

    /// Timeout for tasks submitted without one.
    pub default_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            default_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `submit` or `debounce`
    pub submitted: u64,

    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,

    /// Tasks dropped because the queue was full
    pub dropped: u64,

    /// Debounced tasks replaced by a newer one under the same key
    pub superseded: u64,

    pub panicked: u64,

    /// Tasks in the ready queue
    pub queue_size: usize,

    /// Tasks waiting out a debounce delay
    pub debounced: usize,
}

impl SchedulerStats {
    /// Tasks that have not reached a terminal status.
    pub fn pending(&self) -> usize {
        self.queue_size + self.debounced
    }
}

struct SchedulerState<T> {
    ready: ReadyQueue,
    tasks: HashMap<TaskId, QueuedTask<T>>,
    deadlines: BTreeSet<(Instant, TaskId)>,
    debounced: DebounceTable<T>,
    next_id: TaskId,
    next_seq: u64,
    stats: SchedulerStats,
}

impl<T> SchedulerState<T> {
    fn new() -> Self {
        Self {
            ready: ReadyQueue::new(),
            tasks: HashMap::new(),
            deadlines: BTreeSet::new(),
            debounced: DebounceTable::new(),
            next_id: 1,
            next_seq: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Put a task in the ready queue, dropping the least urgent task if the
    /// queue is full. The newcomer itself is dropped unless it strictly
    /// outranks everything already queued at the lowest priority.
    fn enqueue(&mut self, mut task: QueuedTask<T>, max_depth: usize) -> Option<DrainedTask<T>> {
        let mut dropped = None;
        if self.ready.len() >= max_depth {
            match self.ready.lowest() {
                Some((lowest, victim)) if lowest.priority > task.priority => {
                    dropped = self
                        .remove_queued(victim)
                        .map(|victim| victim.abandon(TaskStatus::Dropped));
                    self.stats.dropped += 1;
                }
                _ => {
                    self.stats.dropped += 1;
                    return Some(task.abandon(TaskStatus::Dropped));
                }
            }
        }

        let key = QueueKey {
            priority: task.priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        task.key = Some(key);
        if let Some(deadline) = task.deadline() {
            self.deadlines.insert((deadline, task.id));
        }
        self.ready.push(key, task.id);
        self.tasks.insert(task.id, task);
        dropped
    }

    fn remove_queued(&mut self, id: TaskId) -> Option<QueuedTask<T>> {
        let task = self.tasks.remove(&id)?;
        if let Some(key) = task.key {
            self.ready.remove(&key);
        }
        if let Some(deadline) = task.deadline() {
            self.deadlines.remove(&(deadline, id));
        }
        Some(task)
    }

    fn remove_pending(&mut self, id: TaskId) -> Option<QueuedTask<T>> {
        match self.remove_queued(id) {
            Some(task) => Some(task),
            None => self.debounced.remove_id(id),
        }
    }

    /// Move debounced tasks whose delay has elapsed into the ready queue.
    /// Their timeout starts counting from here.
    fn promote_due(&mut self, now: Instant, max_depth: usize, settled: &mut Vec<DrainedTask<T>>) {
        for mut task in self.debounced.take_due(now) {
            task.enqueued_at = now;
            if let Some(dropped) = self.enqueue(task, max_depth) {
                settled.push(dropped);
            }
        }
    }

    fn expire_overdue(&mut self, now: Instant, settled: &mut Vec<DrainedTask<T>>) {
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            match self.remove_queued(id) {
                Some(task) => {
                    self.stats.timed_out += 1;
                    settled.push(task.abandon(TaskStatus::TimedOut));
                }
                None => {
                    self.deadlines.pop_first();
                }
            }
        }
    }

    /// Pop the most urgent task that may still run. Tasks whose token was
    /// cancelled externally, or whose deadline passed while earlier tasks
    /// ran, are settled on the way.
    fn next_runnable(&mut self, now: Instant, settled: &mut Vec<DrainedTask<T>>) -> Option<QueuedTask<T>> {
        while let Some((_, id)) = self.ready.pop() {
            let Some(task) = self.tasks.remove(&id) else {
                continue;
            };
            if let Some(deadline) = task.deadline() {
                self.deadlines.remove(&(deadline, id));
            }
            if task.token.is_cancelled() {
                self.stats.cancelled += 1;
                settled.push(task.abandon(TaskStatus::Cancelled));
            } else if task.is_overdue(now) {
                self.stats.timed_out += 1;
                settled.push(task.abandon(TaskStatus::TimedOut));
            } else {
                // Under the lock, so `cancel` sees either a pending or a
                // running task.
                task.cell.set(TaskStatus::Running);
                return Some(task);
            }
        }
        None
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            queue_size: self.ready.len(),
            debounced: self.debounced.len(),
            ..self.stats
        }
    }
}

/// Priority task scheduler with cooperative cancellation, queue timeouts,
/// keyed debounce, and time-bounded draining.
///
/// Share it between threads behind an `Arc`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tilebay_scheduler::{Task, TaskPriority, TaskScheduler};
///
/// let scheduler = TaskScheduler::new();
/// scheduler.submit(Task::new(TaskPriority::Prefetch, |_| "prefetch"));
/// scheduler.submit(Task::new(TaskPriority::Visible, |_| "visible"));
///
/// let done = scheduler.drain(10, Duration::from_millis(16));
/// let values: Vec<_> = done.into_iter().filter_map(|task| task.into_value()).collect();
/// assert_eq!(values, vec!["visible", "prefetch"]);
/// ```
pub struct TaskScheduler<T> {
    config: SchedulerConfig,
    state: Mutex<SchedulerState<T>>,
}

impl<T> TaskScheduler<T> {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::new()),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Queue a task. Never blocks on other producers beyond the queue lock.
    pub fn submit(&self, task: Task<T>) -> TaskHandle {
        let mut state = self.lock();
        let id = state.allocate_id();
        let queued = QueuedTask::from_task(id, task, self.config.default_timeout());
        let handle = queued.handle();
        state.stats.submitted += 1;
        let dropped = state.enqueue(queued, self.max_depth());
        drop(state);

        if let Some(dropped) = dropped {
            warn!(
                task = dropped.id,
                priority = ?dropped.priority,
                "scheduler queue full, dropped task"
            );
        }
        handle
    }

    /// Shorthand for `submit(Task::new(priority, payload))`.
    pub fn submit_fn<F>(&self, priority: TaskPriority, payload: F) -> TaskHandle
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        self.submit(Task::new(priority, payload))
    }

    /// Queue `task` once `delay` passes without another submission under
    /// `key`. A newer submission replaces the pending one, which is settled
    /// as superseded, and restarts the delay.
    pub fn debounce(&self, key: impl Into<String>, task: Task<T>, delay: Duration) -> TaskHandle {
        let key = key.into();
        let mut state = self.lock();
        let id = state.allocate_id();
        let queued = QueuedTask::from_task(id, task, self.config.default_timeout());
        let handle = queued.handle();
        state.stats.submitted += 1;

        let superseded = state.debounced.insert(key.clone(), queued, Instant::now() + delay);
        if superseded.is_some() {
            state.stats.superseded += 1;
        }
        drop(state);

        if let Some(superseded) = superseded {
            trace!(key = %key, task = superseded.id, "debounced task superseded");
            superseded.abandon(TaskStatus::Superseded);
        }
        handle
    }

    /// Cancel a task. A pending task is removed and never runs. A running
    /// task has its token cancelled, finishes cooperatively, and is reported
    /// as cancelled.
    ///
    /// Returns `false` if the task had already finished.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let mut state = self.lock();
        if let Some(task) = state.remove_pending(handle.id()) {
            state.stats.cancelled += 1;
            drop(state);
            task.abandon(TaskStatus::Cancelled);
            return true;
        }
        drop(state);

        if handle.status() == TaskStatus::Running {
            handle.cancel_token().cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every pending task, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        let mut cancelled: Vec<_> = state.tasks.drain().map(|(_, task)| task).collect();
        cancelled.extend(state.debounced.drain_all());
        state.ready.clear();
        state.deadlines.clear();
        state.stats.cancelled += cancelled.len() as u64;
        drop(state);

        let count = cancelled.len();
        for task in cancelled {
            task.abandon(TaskStatus::Cancelled);
        }
        if count > 0 {
            debug!(count, "cancelled all pending tasks");
        }
        count
    }

    /// Run up to `max_items` tasks in priority order, stopping early once
    /// `max_duration` has elapsed. The clock is checked before each task; a
    /// task that has started is never interrupted, but its token reports
    /// cancelled once its timeout passes.
    ///
    /// The result lists every task that reached a terminal status during the
    /// call: the ones that ran, plus any that timed out, were cancelled
    /// through a shared token, or were dropped while promoting debounced
    /// work. Only tasks that ran count toward `max_items`.
    pub fn drain(&self, max_items: usize, max_duration: Duration) -> Vec<DrainedTask<T>> {
        let budget = SliceBudget::new(max_duration);
        let mut finished = Vec::new();

        {
            let mut state = self.lock();
            let now = Instant::now();
            state.promote_due(now, self.max_depth(), &mut finished);
            state.expire_overdue(now, &mut finished);
        }

        let mut ran = 0;
        while ran < max_items && !budget.is_exceeded() {
            let next = self.lock().next_runnable(Instant::now(), &mut finished);
            let Some(task) = next else {
                break;
            };
            finished.push(self.run(task));
            ran += 1;
        }

        if !finished.is_empty() {
            trace!(
                ran,
                settled = finished.len() - ran,
                elapsed_us = budget.elapsed().as_micros() as u64,
                overrun_us = budget.overrun().as_micros() as u64,
                "drained scheduler"
            );
        }
        finished
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock().snapshot()
    }

    /// Tasks waiting in the ready queue or a debounce delay.
    pub fn pending(&self) -> usize {
        self.lock().snapshot().pending()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// When the earliest debounced task becomes ready.
    pub fn next_debounce_due(&self) -> Option<Instant> {
        self.lock().debounced.next_due()
    }

    /// Run a task already marked running by `next_runnable`.
    fn run(&self, task: QueuedTask<T>) -> DrainedTask<T> {
        let deadline = task.deadline();
        let QueuedTask {
            id,
            priority,
            payload,
            enqueued_at,
            token,
            cell,
            ..
        } = task;

        let (status, outcome) = if token.is_cancel_requested() {
            // Cancelled between dequeue and start.
            (TaskStatus::Cancelled, Err(TaskError::Cancelled))
        } else {
            let run_token = match deadline {
                Some(deadline) => token.with_deadline(deadline),
                None => token.clone(),
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| payload(&run_token)));

            match result {
                Ok(_) if run_token.is_expired() => {
                    let elapsed = enqueued_at.elapsed();
                    warn!(
                        task = id,
                        priority = ?priority,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "task overran its timeout"
                    );
                    (TaskStatus::TimedOut, Err(TaskError::TimedOut { elapsed }))
                }
                Ok(_) if token.is_cancel_requested() => {
                    debug!(task = id, "running task was cancelled");
                    (TaskStatus::Cancelled, Err(TaskError::Cancelled))
                }
                Ok(value) => (TaskStatus::Completed, Ok(value)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(task = id, priority = ?priority, %message, "task panicked");
                    (TaskStatus::Panicked, Err(TaskError::Panicked(message)))
                }
            }
        };

        {
            let mut state = self.lock();
            match status {
                TaskStatus::Completed => state.stats.completed += 1,
                TaskStatus::Cancelled => state.stats.cancelled += 1,
                TaskStatus::TimedOut => state.stats.timed_out += 1,
                _ => state.stats.panicked += 1,
            }
        }
        cell.set(status);
        DrainedTask {
            id,
            priority,
            outcome,
        }
    }

    fn max_depth(&self) -> usize {
        self.config.max_queue_depth.max(1)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for TaskScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn values<T>(drained: Vec<DrainedTask<T>>) -> Vec<T> {
        drained.into_iter().filter_map(DrainedTask::into_value).collect()
    }

    #[test]
    fn test_runs_in_priority_order() {
        let scheduler = TaskScheduler::new();
        scheduler.submit_fn(TaskPriority::Idle, |_| 4);
        scheduler.submit_fn(TaskPriority::Margin, |_| 2);
        scheduler.submit_fn(TaskPriority::Immediate, |_| 0);
        scheduler.submit_fn(TaskPriority::Prefetch, |_| 3);
        scheduler.submit_fn(TaskPriority::Visible, |_| 1);

        let drained = scheduler.drain(10, Duration::from_secs(1));
        assert_eq!(values(drained), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let scheduler = TaskScheduler::new();
        for i in 0..20 {
            scheduler.submit_fn(TaskPriority::Visible, move |_| i);
        }
        let drained = scheduler.drain(100, Duration::from_secs(1));
        assert_eq!(values(drained), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_respects_max_items() {
        let scheduler = TaskScheduler::new();
        for i in 0..10 {
            scheduler.submit_fn(TaskPriority::Visible, move |_| i);
        }

        assert_eq!(values(scheduler.drain(3, Duration::from_secs(1))), vec![0, 1, 2]);
        assert_eq!(scheduler.pending(), 7);
        assert_eq!(values(scheduler.drain(100, Duration::from_secs(1))).len(), 7);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_drain_respects_time_budget() {
        let scheduler = TaskScheduler::new();
        for _ in 0..10 {
            scheduler.submit_fn(TaskPriority::Visible, |_| {
                thread::sleep(Duration::from_millis(5));
            });
        }

        let drained = scheduler.drain(100, Duration::from_millis(12));
        // Clock is checked before each task, so at most one overruns.
        assert!(!drained.is_empty());
        assert!(drained.len() <= 3, "ran {}", drained.len());
        assert_eq!(scheduler.pending(), 10 - drained.len());
    }

    #[test]
    fn test_zero_duration_runs_nothing() {
        let scheduler = TaskScheduler::new();
        let handle = scheduler.submit_fn(TaskPriority::Immediate, |_| ());
        assert!(scheduler.drain(10, Duration::ZERO).is_empty());
        assert_eq!(handle.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_cancel_pending_task() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let handle = scheduler.submit_fn(TaskPriority::Visible, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(&handle));
        assert!(!scheduler.cancel(&handle));
        assert_eq!(handle.status(), TaskStatus::Cancelled);

        assert!(scheduler.drain(10, Duration::from_secs(1)).is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[test]
    fn test_cancel_running_task_is_cooperative() {
        let scheduler = Arc::new(TaskScheduler::new());
        let slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));

        let inner_scheduler = scheduler.clone();
        let inner_slot = slot.clone();
        let observed = Arc::new(AtomicBool::new(false));
        let inner_observed = observed.clone();
        let handle = scheduler.submit_fn(TaskPriority::Visible, move |token| {
            let handle = inner_slot.lock().unwrap().clone().unwrap();
            assert_eq!(handle.status(), TaskStatus::Running);
            assert!(inner_scheduler.cancel(&handle));
            inner_observed.store(token.is_cancelled(), Ordering::SeqCst);
            "finished anyway"
        });
        *slot.lock().unwrap() = Some(handle.clone());

        let drained = scheduler.drain(1, Duration::from_secs(1));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].outcome, Err(TaskError::Cancelled));
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(handle.status(), TaskStatus::Cancelled);

        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_cancel_right_after_dequeue_is_not_lost() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = scheduler.submit_fn(TaskPriority::Visible, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        // Consumer has popped the task but not started the payload yet.
        let task = scheduler
            .lock()
            .next_runnable(Instant::now(), &mut Vec::new())
            .unwrap();
        assert_eq!(handle.status(), TaskStatus::Running);
        assert!(scheduler.cancel(&handle));

        let done = scheduler.run(task);
        assert_eq!(done.outcome, Err(TaskError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[test]
    fn test_running_task_times_out() {
        let scheduler = TaskScheduler::new();
        let observed = Arc::new(AtomicBool::new(false));
        let inner_observed = observed.clone();
        let handle = scheduler.submit(
            Task::new(TaskPriority::Visible, move |token| {
                let started = Instant::now();
                while started.elapsed() < Duration::from_secs(2) {
                    if token.is_cancelled() {
                        inner_observed.store(true, Ordering::SeqCst);
                        return "stopped";
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                "ran to the end"
            })
            .with_timeout(Duration::from_millis(30)),
        );

        let started = Instant::now();
        let drained = scheduler.drain(1, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0].outcome, Err(TaskError::TimedOut { .. })));
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(handle.status(), TaskStatus::TimedOut);
        assert!(!handle.cancel_token().is_cancelled());

        let stats = scheduler.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_overrun_without_checking_token_is_timed_out() {
        let scheduler = TaskScheduler::new();
        let handle = scheduler.submit(
            Task::new(TaskPriority::Visible, |_| thread::sleep(Duration::from_millis(40)))
                .with_timeout(Duration::from_millis(20)),
        );
        let quick = scheduler.submit(
            Task::new(TaskPriority::Margin, |_| ()).with_timeout(Duration::from_secs(60)),
        );

        let drained = scheduler.drain(10, Duration::from_secs(5));
        assert!(matches!(drained[0].outcome, Err(TaskError::TimedOut { .. })));
        assert_eq!(handle.status(), TaskStatus::TimedOut);
        assert_eq!(quick.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_shared_token_cancels_before_start() {
        let scheduler = TaskScheduler::new();
        let page_token = CancellationToken::new();
        let first = scheduler.submit(
            Task::new(TaskPriority::Visible, |_| 1).with_token(page_token.clone()),
        );
        let second = scheduler.submit(
            Task::new(TaskPriority::Visible, |_| 2).with_token(page_token.clone()),
        );
        scheduler.submit_fn(TaskPriority::Visible, |_| 3);

        page_token.cancel();
        let drained = scheduler.drain(10, Duration::from_secs(1));

        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0].outcome, Err(TaskError::Cancelled)));
        assert!(matches!(drained[1].outcome, Err(TaskError::Cancelled)));
        assert_eq!(values(drained), vec![3]);
        assert_eq!(first.status(), TaskStatus::Cancelled);
        assert_eq!(second.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_timeout_before_start() {
        let scheduler = TaskScheduler::new();
        let slow = scheduler.submit(
            Task::new(TaskPriority::Visible, |_| "late").with_timeout(Duration::from_millis(1)),
        );
        let patient = scheduler.submit(
            Task::new(TaskPriority::Visible, |_| "ok").with_timeout(Duration::from_secs(60)),
        );

        thread::sleep(Duration::from_millis(5));
        let drained = scheduler.drain(10, Duration::from_secs(1));

        assert_eq!(slow.status(), TaskStatus::TimedOut);
        assert_eq!(patient.status(), TaskStatus::Completed);
        assert!(drained
            .iter()
            .any(|task| task.id == slow.id() && matches!(task.outcome, Err(TaskError::TimedOut { .. }))));
        assert_eq!(values(drained), vec!["ok"]);
        assert_eq!(scheduler.stats().timed_out, 1);
    }

    #[test]
    fn test_default_timeout() {
        let scheduler = TaskScheduler::with_config(
            SchedulerConfig::default().with_default_timeout(Duration::from_millis(1)),
        );
        let handle = scheduler.submit_fn(TaskPriority::Idle, |_| ());
        thread::sleep(Duration::from_millis(5));
        scheduler.drain(10, Duration::from_secs(1));
        assert_eq!(handle.status(), TaskStatus::TimedOut);
    }

    #[test]
    fn test_full_queue_drops_lowest_priority() {
        let scheduler =
            TaskScheduler::with_config(SchedulerConfig::default().with_max_queue_depth(2));
        let idle_a = scheduler.submit_fn(TaskPriority::Idle, |_| "idle-a");
        let idle_b = scheduler.submit_fn(TaskPriority::Idle, |_| "idle-b");

        let visible = scheduler.submit_fn(TaskPriority::Visible, |_| "visible");
        assert_eq!(idle_b.status(), TaskStatus::Dropped);
        assert_eq!(idle_a.status(), TaskStatus::Pending);

        // Does not outrank the lowest queued task, so the newcomer goes.
        let idle_c = scheduler.submit_fn(TaskPriority::Idle, |_| "idle-c");
        assert_eq!(idle_c.status(), TaskStatus::Dropped);

        let drained = scheduler.drain(10, Duration::from_secs(1));
        assert_eq!(values(drained), vec!["visible", "idle-a"]);
        assert_eq!(visible.status(), TaskStatus::Completed);

        let stats = scheduler.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 2);
    }

    #[test]
    fn test_debounce_keeps_last_submission() {
        let scheduler = TaskScheduler::new();
        let first = scheduler.debounce(
            "zoom",
            Task::new(TaskPriority::Visible, |_| "first"),
            Duration::from_millis(20),
        );
        let second = scheduler.debounce(
            "zoom",
            Task::new(TaskPriority::Visible, |_| "second"),
            Duration::from_millis(20),
        );

        assert_eq!(first.status(), TaskStatus::Superseded);
        assert!(scheduler.drain(10, Duration::from_secs(1)).is_empty());
        assert_eq!(scheduler.stats().debounced, 1);

        thread::sleep(Duration::from_millis(30));
        let drained = scheduler.drain(10, Duration::from_secs(1));
        assert_eq!(values(drained), vec!["second"]);
        assert_eq!(second.status(), TaskStatus::Completed);
        assert_eq!(scheduler.stats().superseded, 1);
    }

    #[test]
    fn test_debounce_keys_are_independent() {
        let scheduler = TaskScheduler::new();
        scheduler.debounce("a", Task::new(TaskPriority::Visible, |_| 'a'), Duration::ZERO);
        scheduler.debounce("b", Task::new(TaskPriority::Visible, |_| 'b'), Duration::ZERO);
        assert!(scheduler.next_debounce_due().is_some());

        let mut drained = values(scheduler.drain(10, Duration::from_secs(1)));
        drained.sort();
        assert_eq!(drained, vec!['a', 'b']);
        assert!(scheduler.next_debounce_due().is_none());
    }

    #[test]
    fn test_cancel_debounced_task() {
        let scheduler = TaskScheduler::new();
        let handle = scheduler.debounce(
            "resize",
            Task::new(TaskPriority::Visible, |_| ()),
            Duration::ZERO,
        );
        assert!(scheduler.cancel(&handle));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(scheduler.drain(10, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let scheduler = TaskScheduler::new();
        let queued = scheduler.submit_fn(TaskPriority::Visible, |_| ());
        let debounced =
            scheduler.debounce("k", Task::new(TaskPriority::Idle, |_| ()), Duration::from_secs(5));

        assert_eq!(scheduler.cancel_all(), 2);
        assert_eq!(queued.status(), TaskStatus::Cancelled);
        assert_eq!(debounced.status(), TaskStatus::Cancelled);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let scheduler = TaskScheduler::new();
        let bad = scheduler.submit_fn(TaskPriority::Visible, |_| -> u32 { panic!("decode failed") });
        scheduler.submit_fn(TaskPriority::Visible, |_| 7);

        let drained = scheduler.drain(10, Duration::from_secs(1));
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].outcome,
            Err(TaskError::Panicked("decode failed".to_string()))
        );
        assert_eq!(bad.status(), TaskStatus::Panicked);
        assert_eq!(values(drained), vec![7]);
        assert_eq!(scheduler.stats().panicked, 1);
    }

    #[test]
    fn test_wait_timeout_from_producer_thread() {
        let scheduler = Arc::new(TaskScheduler::new());
        let handle = scheduler.submit_fn(TaskPriority::Visible, |_| ());

        let consumer = {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                scheduler.drain(10, Duration::from_secs(1)).len()
            })
        };

        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), TaskStatus::Completed);
        assert_eq!(consumer.join().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let scheduler = Arc::new(TaskScheduler::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        scheduler.submit_fn(TaskPriority::Prefetch, move |_| p * 1000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let drained = values(scheduler.drain(10_000, Duration::from_secs(5)));
        assert_eq!(drained.len(), 1000);

        // Each producer's tasks keep their submission order.
        for p in 0..4 {
            let mine: Vec<_> = drained.iter().filter(|v| **v / 1000 == p).collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
