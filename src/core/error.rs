//! Error types for the locking core and the scheduler.

use thiserror::Error;

use crate::util::{MutexId, ThreadKey};

/// Outcome of a tracked-mutex operation that did not succeed.
///
/// `AlreadyLocked` and `WouldDeadlock` are contention outcomes and mean the
/// same thing to a caller: do not block, back off and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// The mutex is held, by the caller itself or by someone else on a
    /// non-blocking attempt.
    #[error("mutex already locked")]
    AlreadyLocked,
    /// Blocking here would close a cycle in the wait-for graph.
    #[error("waiting for {mutex} would deadlock {thread}")]
    WouldDeadlock {
        /// Mutex that was requested.
        mutex: MutexId,
        /// Thread whose request was refused.
        thread: ThreadKey,
    },
    /// A timed attempt ran out of time.
    #[error("timed out waiting for mutex")]
    TimedOut,
    /// The calling thread does not own the mutex it tried to release.
    #[error("mutex not owned by {0}")]
    NotOwner(ThreadKey),
    /// The operation is not valid for the primitive's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Bookkeeping for the lock could not be allocated.
    #[error("out of memory while tracking lock ownership")]
    ResourceExhausted,
}

impl LockError {
    /// True for outcomes that mean "someone else has it, back off".
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyLocked | Self::WouldDeadlock { .. })
    }
}

/// Errors from the non-blocking and waiting pop paths of a blocking queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Nothing queued.
    #[error("queue empty")]
    Empty,
    /// Queue shut down and drained.
    #[error("queue shut down")]
    Shutdown,
    /// The caller's running flag was cleared while waiting.
    #[error("waiter stopped")]
    Stopped,
    /// A bounded wait elapsed with nothing to pop.
    #[error("timed out waiting for an item")]
    TimedOut,
}

/// Rejected push. The item is handed back so the caller can run or drop it.
#[derive(Debug, Error)]
pub enum PushError<T> {
    /// Capacity reached.
    #[error("queue full")]
    Full(T),
    /// Queue no longer accepts items.
    #[error("queue shut down")]
    Shutdown(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Shutdown(item) => item,
        }
    }
}

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker or timer thread could not be started.
    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        /// Which thread failed (`worker` or `timer`).
        role: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Scheduled-task heap is at capacity.
    #[error("scheduled task heap full ({0} entries)")]
    HeapFull(usize),
    /// The scheduler has been shut down.
    #[error("scheduler shut down")]
    Shutdown,
    /// An internal lock operation failed.
    #[error("lock failure: {0}")]
    Lock(#[from] LockError),
}

/// Ways a task result can fail to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The scheduled task was cancelled before it fired.
    #[error("task cancelled")]
    Cancelled,
    /// The task panicked or was dropped without running.
    #[error("task abandoned before producing a result")]
    Abandoned,
    /// No result within the requested time.
    #[error("timed out waiting for task result")]
    Timeout,
}

/// Errors from installing the process-wide lock registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A registry was installed (or lazily created) before this call.
    #[error("lock registry already initialized")]
    AlreadyInitialized,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
