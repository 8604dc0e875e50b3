//! Background task orchestration: lifecycle, progress, cancellation,
//! coalescing, and the session's shared analysis state.
//!
//! Work items run on the tokio multi-thread runtime; the interactive side
//! only ever receives callbacks and never blocks on a task. The scheduler is
//! the single point of mutation for all process-wide state: the task table,
//! the per-resource-key in-flight registry, and the active area of interest.

pub mod work_item;

pub use work_item::{
    CancelToken, DoneCallback, ProgressCallback, TaskId, TaskKind, TaskStatus, TaskTermination,
};

use crate::types::{AreaOfInterest, KanopiError, KanopiResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handles passed into a running work item: the cancellation token to poll
/// at checkpoints and the progress reporter.
pub struct TaskContext<T: Clone + Send + 'static> {
    pub token: CancelToken,
    progress: ProgressHandle<T>,
}

impl<T: Clone + Send + 'static> TaskContext<T> {
    /// Report a progress fraction in [0, 1]. Regressions are ignored so
    /// subscribers always observe a non-decreasing sequence.
    pub fn report_progress(&self, fraction: f64) {
        self.progress.report(fraction);
    }
}

/// Progress reporter bound to one task
struct ProgressHandle<T: Clone + Send + 'static> {
    inner: Arc<SchedulerInner<T>>,
    id: TaskId,
}

impl<T: Clone + Send + 'static> ProgressHandle<T> {
    fn report(&self, fraction: f64) {
        self.inner.report_progress(self.id, fraction);
    }
}

struct TaskEntry<T> {
    kind: TaskKind,
    resource_key: String,
    status: TaskStatus,
    progress: f64,
    cancel: CancelToken,
    progress_subs: Vec<ProgressCallback>,
    done_subs: Vec<DoneCallback<T>>,
    termination: Option<TaskTermination<T>>,
}

struct SchedulerState<T> {
    tasks: HashMap<TaskId, TaskEntry<T>>,
    /// At most one in-flight task per logical resource key
    inflight: HashMap<String, TaskId>,
    /// At most one active AOI per session
    active_aoi: Option<AreaOfInterest>,
}

struct SchedulerInner<T> {
    state: Mutex<SchedulerState<T>>,
    runtime: tokio::runtime::Handle,
    next_id: AtomicU64,
}

/// Runs units of cancellable background work and delivers progress and
/// terminal signals to subscribers.
///
/// Generic over the task output type so the scheduler itself depends on no
/// analysis component; the coordinator instantiates it with its output enum.
pub struct TaskScheduler<T: Clone + Send + 'static> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for TaskScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TaskScheduler<T> {
    /// Create a scheduler on the current tokio runtime. Must be called from
    /// within a runtime context.
    pub fn new() -> Self {
        Self::with_runtime(tokio::runtime::Handle::current())
    }

    pub fn with_runtime(runtime: tokio::runtime::Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    inflight: HashMap::new(),
                    active_aoi: None,
                }),
                runtime,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Submit a unit of background work.
    ///
    /// If another task with the same resource key is still in flight, no new
    /// work is started: the existing task id is returned and the caller's
    /// subscribers attach to it (coalescing).
    pub fn submit<F, Fut>(&self, kind: TaskKind, resource_key: &str, work: F) -> TaskId
    where
        F: FnOnce(TaskContext<T>) -> Fut + Send + 'static,
        Fut: Future<Output = KanopiResult<T>> + Send + 'static,
    {
        let (id, token) = {
            let mut state = self.lock_state();
            if let Some(existing) = state.inflight.get(resource_key) {
                if state
                    .tasks
                    .get(existing)
                    .map(|entry| !entry.status.is_terminal())
                    .unwrap_or(false)
                {
                    log::info!(
                        "Coalescing {} submit onto in-flight {} (key '{}')",
                        kind,
                        existing,
                        resource_key
                    );
                    return *existing;
                }
            }

            let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            let token = CancelToken::new();
            state.tasks.insert(
                id,
                TaskEntry {
                    kind,
                    resource_key: resource_key.to_string(),
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    cancel: token.clone(),
                    progress_subs: Vec::new(),
                    done_subs: Vec::new(),
                    termination: None,
                },
            );
            state.inflight.insert(resource_key.to_string(), id);
            (id, token)
        };

        log::info!("Submitted {} as {} (key '{}')", kind, id, resource_key);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            // Pending -> running gate; a task cancelled while pending never
            // enters running.
            {
                let mut state = inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match state.tasks.get_mut(&id) {
                    Some(entry) if entry.status == TaskStatus::Pending => {
                        entry.status = TaskStatus::Running;
                    }
                    _ => {
                        log::debug!("{} no longer pending; skipping execution", id);
                        return;
                    }
                }
            }

            let context = TaskContext {
                token,
                progress: ProgressHandle {
                    inner: Arc::clone(&inner),
                    id,
                },
            };
            let result = work(context).await;
            inner.finish(id, result);
        });

        id
    }

    /// Request cancellation. Accepted from pending or running only; the
    /// terminal state is reported to subscribers immediately even if the
    /// computation has not yet observed its flag (a worker finishing
    /// afterwards has its outcome discarded and logged).
    pub fn cancel(&self, id: TaskId) -> bool {
        let done_subs = {
            let mut state = self.lock_state();
            let entry = match state.tasks.get_mut(&id) {
                Some(entry) => entry,
                None => return false,
            };
            if entry.status.is_terminal() {
                log::debug!("Cancel ignored: {} already {}", id, entry.status);
                return false;
            }

            entry.cancel.cancel();
            log::info!("Cancelling {} (was {})", id, entry.status);
            entry.status = TaskStatus::Cancelled;
            entry.termination = Some(TaskTermination::Cancelled);
            let subs: Vec<DoneCallback<T>> = entry.done_subs.drain(..).collect();
            let key = entry.resource_key.clone();
            Self::release_key(&mut state, &key, id);
            subs
        };

        for on_done in done_subs {
            on_done(TaskTermination::Cancelled);
        }
        true
    }

    /// Attach progress and completion subscribers to a task. A subscriber
    /// attaching after the terminal state receives the stored outcome
    /// immediately; the done callback still fires exactly once.
    pub fn subscribe<P, D>(&self, id: TaskId, on_progress: P, on_done: D) -> bool
    where
        P: Fn(f64) + Send + Sync + 'static,
        D: FnOnce(TaskTermination<T>) + Send + 'static,
    {
        let mut on_done: Option<DoneCallback<T>> = Some(Box::new(on_done));
        let late_termination = {
            let mut state = self.lock_state();
            let entry = match state.tasks.get_mut(&id) {
                Some(entry) => entry,
                None => return false,
            };
            match &entry.termination {
                Some(termination) => Some(termination.clone()),
                None => {
                    entry.progress_subs.push(Arc::new(on_progress));
                    if let Some(done) = on_done.take() {
                        entry.done_subs.push(done);
                    }
                    None
                }
            }
        };

        if let (Some(termination), Some(done)) = (late_termination, on_done.take()) {
            done(termination);
        }
        true
    }

    /// Destroy a work item after its consumer has seen the terminal state.
    pub fn acknowledge(&self, id: TaskId) -> bool {
        let mut state = self.lock_state();
        match state.tasks.get(&id) {
            Some(entry) if entry.status.is_terminal() => {
                state.tasks.remove(&id);
                log::debug!("Acknowledged and removed {}", id);
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.lock_state().tasks.get(&id).map(|entry| entry.status)
    }

    pub fn progress(&self, id: TaskId) -> Option<f64> {
        self.lock_state().tasks.get(&id).map(|entry| entry.progress)
    }

    pub fn kind(&self, id: TaskId) -> Option<TaskKind> {
        self.lock_state().tasks.get(&id).map(|entry| entry.kind)
    }

    /// Replace the session's active area of interest, returning the one it
    /// discards. This is the only mutation path for the AOI.
    pub fn set_active_aoi(&self, aoi: Option<AreaOfInterest>) -> Option<AreaOfInterest> {
        let mut state = self.lock_state();
        let previous = state.active_aoi.take();
        if previous.is_some() {
            log::info!("Replacing active AOI");
        }
        state.active_aoi = aoi;
        previous
    }

    pub fn active_aoi(&self) -> Option<AreaOfInterest> {
        self.lock_state().active_aoi.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_key(state: &mut SchedulerState<T>, key: &str, id: TaskId) {
        if state.inflight.get(key) == Some(&id) {
            state.inflight.remove(key);
        }
    }
}

impl<T: Clone + Send + 'static> SchedulerInner<T> {
    fn report_progress(&self, id: TaskId, fraction: f64) {
        let subs = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = match state.tasks.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };
            if entry.status.is_terminal() {
                return;
            }
            let effective = fraction.clamp(0.0, 1.0);
            if effective <= entry.progress {
                return;
            }
            entry.progress = effective;
            entry.progress_subs.clone()
        };

        let effective = fraction.clamp(0.0, 1.0);
        for on_progress in subs {
            on_progress(effective);
        }
    }

    fn finish(&self, id: TaskId, result: KanopiResult<T>) {
        let termination = match result {
            Ok(output) => TaskTermination::Succeeded(output),
            Err(KanopiError::Cancelled) => TaskTermination::Cancelled,
            Err(error) => TaskTermination::Failed(error),
        };

        let (progress_subs, done_subs, final_progress) = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = match state.tasks.get_mut(&id) {
                Some(entry) => entry,
                None => {
                    log::warn!("{} finished after removal; discarding result", id);
                    return;
                }
            };
            if entry.status.is_terminal() {
                // Cancelled under us while the worker was still going
                log::warn!(
                    "{} finished after {} was already reported; discarding result",
                    id,
                    entry.status
                );
                return;
            }

            let next = termination.status();
            if !entry.status.can_transition_to(next) {
                log::warn!("Refusing {} -> {} for {}", entry.status, next, id);
                return;
            }
            entry.status = next;
            entry.termination = Some(termination.clone());

            let final_progress = if next == TaskStatus::Succeeded && entry.progress < 1.0 {
                entry.progress = 1.0;
                Some(entry.progress_subs.clone())
            } else {
                None
            };
            let done: Vec<DoneCallback<T>> = entry.done_subs.drain(..).collect();
            let key = entry.resource_key.clone();
            TaskScheduler::<T>::release_key(&mut state, &key, id);
            log::info!("{} finished: {}", id, next);
            (final_progress, done, 1.0_f64)
        };

        // Progress events precede the terminal event for a given task
        if let Some(subs) = progress_subs {
            for on_progress in subs {
                on_progress(final_progress);
            }
        }
        for on_done in done_subs {
            on_done(termination.clone());
        }
    }
}
