//! Task bodies, result futures and scheduled-task handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::core::error::TaskError;

/// Work to run. Periodic bodies are shared between firings.
pub(crate) enum TaskBody {
    Once(Box<dyn FnOnce() + Send>),
    Periodic(Arc<dyn Fn() + Send + Sync>),
}

impl TaskBody {
    pub(crate) fn run(self) {
        match self {
            Self::Once(body) => body(),
            Self::Periodic(body) => body(),
        }
    }
}

/// Unit of work on the immediate queue.
pub(crate) struct Job {
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub label: &'static str,
    pub body: TaskBody,
}

/// Entry in the timer heap.
pub(crate) struct TimerEntry {
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub label: &'static str,
    pub interval: Option<Duration>,
    pub body: TaskBody,
    pub cancel: Arc<CancelState>,
}

impl TimerEntry {
    /// Job for one firing. Periodic entries keep their body for re-arming.
    pub(crate) fn fire(self) -> (Job, Option<Self>) {
        let shared_body = match &self.body {
            TaskBody::Periodic(body) => Some(Arc::clone(body)),
            TaskBody::Once(_) => None,
        };
        if let Some(body) = shared_body {
            let job = Job {
                span_id: self.span_id,
                parent_id: self.parent_id,
                label: self.label,
                body: TaskBody::Periodic(body),
            };
            return (job, Some(self));
        }
        let Self {
            span_id,
            parent_id,
            label,
            body,
            ..
        } = self;
        let job = Job {
            span_id,
            parent_id,
            label,
            body,
        };
        (job, None)
    }
}

/// Shared cancellation flag of a timed task.
#[derive(Debug)]
pub(crate) struct CancelState {
    cancelled: AtomicBool,
    pub key: u64,
}

impl CancelState {
    pub(crate) const fn new(key: u64) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            key,
        }
    }

    /// Set the flag. True only for the call that set it.
    pub(crate) fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Receiving end of a task's result.
///
/// The result arrives once. If the task never produces one, the outcome is
/// [`TaskError::Cancelled`] for a cancelled timed task and
/// [`TaskError::Abandoned`] otherwise (the body panicked, or the scheduler
/// dropped it during shutdown).
pub struct TaskFuture<R> {
    rx: Receiver<R>,
    cancel: Option<Arc<CancelState>>,
    span_id: u64,
}

impl<R> TaskFuture<R> {
    pub(crate) const fn new(rx: Receiver<R>, cancel: Option<Arc<CancelState>>, span_id: u64) -> Self {
        Self { rx, cancel, span_id }
    }

    fn missing(&self) -> TaskError {
        missing_result(self.cancel.as_ref())
    }

    /// Trace span of the task.
    pub const fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Block until the result arrives.
    ///
    /// # Errors
    ///
    /// `Cancelled` or `Abandoned` when no result will ever arrive.
    pub fn wait(self) -> Result<R, TaskError> {
        self.rx.recv().map_err(|_| self.missing())
    }

    /// Block for at most `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived in time, else as [`wait`](Self::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, TaskError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TaskError::Timeout,
            RecvTimeoutError::Disconnected => self.missing(),
        })
    }

    /// Take the result if it is already there.
    ///
    /// # Errors
    ///
    /// `Cancelled` or `Abandoned` when no result will ever arrive.
    pub fn try_get(&self) -> Result<Option<R>, TaskError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.missing()),
        }
    }

    /// Whether a result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(feature = "tokio-runtime")]
impl<R: Send + 'static> TaskFuture<R> {
    /// Await the result without blocking the async runtime.
    ///
    /// The channel wait moves to tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait).
    pub async fn wait_async(self) -> Result<R, TaskError> {
        let Self { rx, cancel, .. } = self;
        match tokio::task::spawn_blocking(move || rx.recv()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => Err(missing_result(cancel.as_ref())),
        }
    }
}

fn missing_result(cancel: Option<&Arc<CancelState>>) -> TaskError {
    if cancel.is_some_and(|state| state.is_cancelled()) {
        TaskError::Cancelled
    } else {
        TaskError::Abandoned
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("span_id", &self.span_id)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Handle to a timed task. The default handle refers to nothing.
#[derive(Clone, Default)]
pub struct ScheduledTaskHandle {
    state: Option<Arc<CancelState>>,
    span_id: u64,
}

impl ScheduledTaskHandle {
    pub(crate) const fn new(state: Arc<CancelState>, span_id: u64) -> Self {
        Self {
            state: Some(state),
            span_id,
        }
    }

    /// Mark the task cancelled.
    ///
    /// Only the flag is set. The entry stays in the timer heap until it
    /// becomes due, and the timer thread then drops it instead of firing.
    /// A firing already handed to the queue still runs.
    ///
    /// Returns `true` the first time it is called on a valid handle, `false`
    /// on an invalid handle or when already cancelled.
    pub fn cancel(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.cancel())
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_cancelled())
    }

    /// Whether the handle refers to a task.
    pub const fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    /// Trace span of the task (0 for an invalid handle).
    pub const fn span_id(&self) -> u64 {
        self.span_id
    }
}

impl fmt::Debug for ScheduledTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTaskHandle")
            .field("valid", &self.is_valid())
            .field("cancelled", &self.is_cancelled())
            .field("span_id", &self.span_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_default_handle_is_invalid() {
        let handle = ScheduledTaskHandle::default();
        assert!(!handle.is_valid());
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_cancel_once() {
        let handle = ScheduledTaskHandle::new(Arc::new(CancelState::new(1)), 5);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.clone().is_cancelled());
    }

    #[test]
    fn test_future_outcomes() {
        let (tx, rx) = bounded(1);
        let future = TaskFuture::new(rx, None, 1);
        assert_eq!(future.try_get(), Ok(None));
        assert_eq!(future.wait_timeout(Duration::from_millis(5)), Err(TaskError::Timeout));
        tx.send(3).unwrap();
        assert!(future.is_ready());
        assert_eq!(future.wait(), Ok(3));

        let (tx, rx) = bounded::<u8>(1);
        drop(tx);
        assert_eq!(TaskFuture::new(rx, None, 2).wait(), Err(TaskError::Abandoned));

        let state = Arc::new(CancelState::new(3));
        state.cancel();
        let (tx, rx) = bounded::<u8>(1);
        drop(tx);
        assert_eq!(TaskFuture::new(rx, Some(state), 3).wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn test_periodic_entry_survives_firing() {
        let entry = TimerEntry {
            span_id: 1,
            parent_id: None,
            label: "periodic",
            interval: Some(Duration::from_millis(1)),
            body: TaskBody::Periodic(Arc::new(|| {})),
            cancel: Arc::new(CancelState::new(1)),
        };
        let (job, rearm) = entry.fire();
        assert!(rearm.is_some());
        job.body.run();

        let once = TimerEntry {
            span_id: 2,
            parent_id: None,
            label: "once",
            interval: None,
            body: TaskBody::Once(Box::new(|| {})),
            cancel: Arc::new(CancelState::new(2)),
        };
        let (job, rearm) = once.fire();
        assert!(rearm.is_none());
        assert_eq!(job.span_id, 2);
    }

    #[test]
    fn test_fired_job_ignores_later_cancel() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let entry = TimerEntry {
            span_id: 3,
            parent_id: None,
            label: "once",
            interval: None,
            body: TaskBody::Once(Box::new(move || ran2.store(true, Ordering::SeqCst))),
            cancel: Arc::new(CancelState::new(3)),
        };
        let state = Arc::clone(&entry.cancel);
        let (job, _) = entry.fire();
        assert!(state.cancel());
        job.body.run();
        assert!(ran.load(Ordering::SeqCst));
    }
}
