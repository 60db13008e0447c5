//! Cancellation tokens for cooperative task cancellation
//!
//! The scheduler never terminates a thread. Work that may run for a while
//! checks its token at natural checkpoints and returns early once the token
//! is cancelled. A token handed to a running task with a timeout also reports
//! cancelled once the task's deadline passes.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use crate::task::TaskError;

/// Cancellation token for cooperative cancellation
///
/// Clones share the same underlying flag, so cancelling any clone is
/// observed by all of them. A deadline belongs to one copy only.
///
/// # Example
///
/// ```
/// use tilebay_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// // In worker thread:
/// // for chunk in work {
/// //     worker_token.checkpoint()?;
/// //     // ... do work ...
/// // }
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and all of its clones. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if this token has been cancelled or its deadline has passed
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.is_expired()
    }

    /// A copy sharing this token's flag that also counts as cancelled from
    /// `deadline` on. The original is unaffected.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            cancelled: self.cancelled.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline, if any, has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Whether `cancel` was called on this token or a clone.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(TaskError::Cancelled)` once cancelled, for use with `?` inside
    /// long-running work.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether two tokens share the same flag.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancel_requested())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_token_basic() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(TaskError::Cancelled));
    }

    #[test]
    fn test_token_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();
        assert!(token1.same_as(&token2));
        assert!(!token1.same_as(&CancellationToken::new()));

        token1.cancel();
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_token_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_deadline_copy_expires_alone() {
        let token = CancellationToken::new();
        let running = token.with_deadline(Instant::now() + Duration::from_millis(5));
        assert!(running.same_as(&token));
        assert!(!running.is_cancelled());

        thread::sleep(Duration::from_millis(10));
        assert!(running.is_expired());
        assert!(running.is_cancelled());
        assert!(!running.is_cancel_requested());
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(running.is_cancel_requested());
    }

    #[test]
    fn test_token_observed_across_threads() {
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let worker = thread::spawn(move || {
            let mut iterations = 0u32;
            while worker_token.checkpoint().is_ok() {
                iterations += 1;
                thread::sleep(Duration::from_millis(1));
            }
            iterations
        });

        thread::sleep(Duration::from_millis(10));
        token.cancel();
        let iterations = worker.join().unwrap();
        assert!(iterations > 0);
    }
}
