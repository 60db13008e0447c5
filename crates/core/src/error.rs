//! Errors raised by the registry and worker admission

use std::fmt;

use crate::registry::ObjectId;

/// Why the registry refused a new object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `max_objects` live objects are already registered
    ObjectLimit { limit: usize },

    /// The object's estimate would push tracked memory past the budget
    MemoryLimit { requested: usize, available: usize },

    /// The last memory sample was critical
    CriticalPressure,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ObjectLimit { limit } => write!(f, "object limit of {limit} reached"),
            RejectReason::MemoryLimit {
                requested,
                available,
            } => write!(
                f,
                "needs {requested} bytes but only {available} bytes remain in the budget"
            ),
            RejectReason::CriticalPressure => write!(f, "memory pressure is critical"),
        }
    }
}

/// Errors returned by [`ResourceRegistry`](crate::ResourceRegistry)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: RejectReason },

    #[error("object {0} has been disposed")]
    Disposed(ObjectId),

    #[error("object was dropped by its owner before registration")]
    ObjectDropped,

    #[error("worker limit of {limit} reached")]
    WorkerLimitReached { limit: usize },
}

impl RegistryError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegistryError::RegistrationRejected { .. } | RegistryError::WorkerLimitReached { .. }
        )
    }
}

/// Result alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
