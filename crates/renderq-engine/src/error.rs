//! Engine error types.

use renderq_models::{TaskId, TaskStatus};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duplicate submission, task {existing} is still live")]
    DuplicateTask { existing: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task} is already leased")]
    AlreadyLeased { task: TaskId },

    #[error("Lease on task {task} has expired")]
    LeaseExpired { task: TaskId },

    #[error("Lease on task {task} lost to another holder")]
    LeaseLost { task: TaskId },

    #[error("Task {task} is not cancellable from status {status}")]
    NotCancellable { task: TaskId, status: TaskStatus },

    #[error("Stale checkpoint for task {task}: seq {got} <= stored {stored}")]
    StaleCheckpoint { task: TaskId, stored: u64, got: u64 },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Backend unavailable: {0}")]
    Backend(String),
}

impl EngineError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Concurrency-control signals are resolved inside the core: the caller
    /// drops the work item or abandons the attempt, nothing is surfaced to
    /// producers.
    pub fn is_concurrency_signal(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyLeased { .. }
                | EngineError::LeaseExpired { .. }
                | EngineError::LeaseLost { .. }
        )
    }

    /// Infrastructure errors abort the in-flight operation without mutating
    /// task state; the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Backend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_models::TaskId;

    #[test]
    fn test_concurrency_signals() {
        let task = TaskId::from_string("t1");
        assert!(EngineError::AlreadyLeased { task: task.clone() }.is_concurrency_signal());
        assert!(EngineError::LeaseExpired { task: task.clone() }.is_concurrency_signal());
        assert!(EngineError::LeaseLost { task }.is_concurrency_signal());
        assert!(!EngineError::backend("redis down").is_concurrency_signal());
    }

    #[test]
    fn test_only_backend_is_retryable() {
        assert!(EngineError::backend("redis down").is_retryable());
        assert!(!EngineError::validation("bad url").is_retryable());
    }
}
