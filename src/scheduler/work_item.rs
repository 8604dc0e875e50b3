use crate::types::{KanopiError, KanopiResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Opaque identity of a unit of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{:06}", self.0)
    }
}

/// Kinds of background work the engine schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    CatalogSearch,
    BandMath,
    QcDiff,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::CatalogSearch => "catalog-search",
            TaskKind::BandMath => "band-math",
            TaskKind::QcDiff => "qc-diff",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Work-item lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Forward-only transition check. Cancellation is accepted from pending
    /// or running only.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Cooperative cancellation flag shared between the scheduler and a running
/// work item. The computation polls it at safe checkpoints (after each
/// catalog page, after each fetched band) and aborts promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint for `?` propagation: turns a set flag into
    /// `KanopiError::Cancelled`.
    pub fn checkpoint(&self) -> KanopiResult<()> {
        if self.is_cancelled() {
            Err(KanopiError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Terminal notification delivered to each subscriber exactly once.
/// Cancellation is its own terminal state, never an error.
#[derive(Debug, Clone)]
pub enum TaskTermination<T> {
    Succeeded(T),
    Failed(KanopiError),
    Cancelled,
}

impl<T> TaskTermination<T> {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskTermination::Succeeded(_) => TaskStatus::Succeeded,
            TaskTermination::Failed(_) => TaskStatus::Failed,
            TaskTermination::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Progress subscriber: fraction in [0, 1], monotonically non-decreasing
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Completion subscriber, invoked exactly once
pub type DoneCallback<T> = Box<dyn FnOnce(TaskTermination<T>) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Succeeded));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Succeeded));
        // A succeeded task cannot be cancelled
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_cancel_token_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert_eq!(token.checkpoint(), Err(KanopiError::Cancelled));
    }
}
