//! Tasks, their handles, and their outcomes

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::priority::{QueueKey, TaskId, TaskPriority};

/// Work executed by the consumer. Receives the task's cancellation token.
pub type TaskPayload<T> = Box<dyn FnOnce(&CancellationToken) -> T + Send>;

/// Why a task produced no value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task timed out {elapsed:?} after it was queued")]
    TimedOut { elapsed: Duration },

    #[error("task was dropped because the queue was full")]
    Dropped,

    #[error("task was superseded by a newer debounced task")]
    Superseded,

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Result of one task as reported by `drain`
pub type TaskOutcome<T> = Result<T, TaskError>;

/// Lifecycle of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Queued or waiting out a debounce delay
    Pending,
    Running,
    Completed,
    Cancelled,
    TimedOut,
    Dropped,
    Superseded,
    Panicked,
}

impl TaskStatus {
    /// Whether the task will never change status again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// A unit of work waiting to be submitted
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tilebay_scheduler::{Task, TaskPriority};
///
/// let task = Task::new(TaskPriority::Visible, |_token| 42)
///     .with_timeout(Duration::from_millis(500));
/// assert_eq!(task.priority(), TaskPriority::Visible);
/// ```
pub struct Task<T> {
    pub(crate) priority: TaskPriority,
    pub(crate) payload: TaskPayload<T>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) token: CancellationToken,
}

impl<T> Task<T> {
    pub fn new<F>(priority: TaskPriority, payload: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        Self {
            priority,
            payload: Box::new(payload),
            timeout: None,
            token: CancellationToken::new(),
        }
    }

    /// Give the task `timeout` from being queued to finish. A task still
    /// queued at the deadline never runs; a running payload sees its token
    /// cancelled and whatever it returns late is discarded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a token shared with other work, e.g. every tile of one page.
    /// Cancelling it externally cancels the task before it starts.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Shared status cell between the scheduler and every handle clone.
#[derive(Debug)]
pub(crate) struct TaskCell {
    status: Mutex<TaskStatus>,
    changed: Condvar,
}

impl TaskCell {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> TaskStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, status: TaskStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        *current = status;
        self.changed.notify_all();
    }

    fn wait_terminal(&self, timeout: Duration) -> TaskStatus {
        let guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |status| !status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Handle to a submitted task
///
/// Cheap to clone. Observes the task's status and can wait for it to finish;
/// the task's value itself is delivered through `drain`.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    priority: TaskPriority,
    token: CancellationToken,
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        priority: TaskPriority,
        token: CancellationToken,
        cell: Arc<TaskCell>,
    ) -> Self {
        Self {
            id,
            priority,
            token,
            cell,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn status(&self) -> TaskStatus {
        self.cell.get()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Token checked by the task's payload.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block until the task reaches a terminal status or `timeout` elapses,
    /// returning the status at that point.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskStatus {
        self.cell.wait_terminal(timeout)
    }
}

/// A task after submission, owned by the scheduler.
pub(crate) struct QueuedTask<T> {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub payload: TaskPayload<T>,
    pub enqueued_at: Instant,
    pub timeout: Option<Duration>,
    pub token: CancellationToken,
    pub cell: Arc<TaskCell>,
    /// Set once the task sits in the ready queue.
    pub key: Option<QueueKey>,
}

impl<T> QueuedTask<T> {
    pub fn from_task(id: TaskId, task: Task<T>, default_timeout: Option<Duration>) -> Self {
        Self {
            id,
            priority: task.priority,
            payload: task.payload,
            enqueued_at: Instant::now(),
            timeout: task.timeout.or(default_timeout),
            token: task.token,
            cell: Arc::new(TaskCell::new()),
            key: None,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.id, self.priority, self.token.clone(), self.cell.clone())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.enqueued_at + timeout)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Settle a task that will never run. The token is left alone since it
    /// may be shared with sibling tasks.
    pub fn abandon(self, status: TaskStatus) -> DrainedTask<T> {
        let error = match status {
            TaskStatus::TimedOut => TaskError::TimedOut {
                elapsed: self.enqueued_at.elapsed(),
            },
            TaskStatus::Dropped => TaskError::Dropped,
            TaskStatus::Superseded => TaskError::Superseded,
            _ => TaskError::Cancelled,
        };
        self.cell.set(status);
        DrainedTask {
            id: self.id,
            priority: self.priority,
            outcome: Err(error),
        }
    }
}

/// One entry of a `drain` result
#[derive(Debug)]
pub struct DrainedTask<T> {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub outcome: TaskOutcome<T>,
}

impl<T> DrainedTask<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The produced value, if the task ran.
    pub fn into_value(self) -> Option<T> {
        self.outcome.ok()
    }
}
