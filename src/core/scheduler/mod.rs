//! Task scheduler: a worker pool fed by a blocking queue plus a timer thread
//! for delayed and periodic work.
//!
//! # Key Features
//!
//! - **Immediate tasks**: [`TaskScheduler::submit`] hands a closure to the
//!   workers and returns a [`TaskFuture`] for its result
//! - **Timed tasks**: [`TaskScheduler::schedule_after`] and
//!   [`TaskScheduler::schedule_every`] go through a fire-time heap guarded by
//!   a tracked mutex
//! - **Forward progress**: when the queue or the heap refuses a task, the
//!   caller runs it inline instead of dropping it
//! - **Tracing**: every lifecycle step is reported through [`crate::core::trace`]
//!
//! # Example
//!
//! ```
//! use lockgraph::config::SchedulerConfig;
//! use lockgraph::core::TaskScheduler;
//! use std::time::Duration;
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::new().with_worker_count(2)).unwrap();
//!
//! let answer = scheduler.submit(|| 6 * 7);
//! assert_eq!(answer.wait().unwrap(), 42);
//!
//! let (later, _handle) = scheduler.schedule_after(Duration::from_millis(5), || "done");
//! assert_eq!(later.wait().unwrap(), "done");
//!
//! scheduler.shutdown();
//! ```

mod pool;
mod task;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

pub use pool::TaskScheduler;
pub use task::{ScheduledTaskHandle, TaskFuture};

/// Snapshot of scheduler utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Worker threads alive.
    pub worker_total: usize,
    /// Workers running a task.
    pub worker_active: usize,
    /// Workers waiting for a task.
    pub worker_idle: usize,
    /// Tasks waiting in the immediate queue.
    pub queue_size: usize,
    /// Pending timed entries.
    pub scheduled_count: usize,
    /// Tasks handed to the scheduler (immediate and timed).
    pub submitted_tasks: u64,
    /// Task bodies that returned normally.
    pub completed_tasks: u64,
    /// Task bodies that panicked.
    pub panicked_tasks: u64,
    /// Bodies run on the caller (or timer) thread because a handoff was refused.
    pub inline_runs: u64,
    /// Timed entries dropped by cancellation.
    pub cancelled_tasks: u64,
}

/// Internal counters (lock-free atomics).
#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub worker_total: AtomicUsize,
    pub worker_active: AtomicUsize,
    pub worker_idle: AtomicUsize,
    pub scheduled_count: AtomicUsize,
    pub submitted_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub panicked_tasks: AtomicU64,
    pub inline_runs: AtomicU64,
    pub cancelled_tasks: AtomicU64,
}

impl SchedulerCounters {
    /// Snapshot with the live queue length filled in.
    pub fn snapshot(&self, queue_size: usize) -> SchedulerStats {
        SchedulerStats {
            worker_total: self.worker_total.load(Ordering::Acquire),
            worker_active: self.worker_active.load(Ordering::Acquire),
            worker_idle: self.worker_idle.load(Ordering::Acquire),
            queue_size,
            scheduled_count: self.scheduled_count.load(Ordering::Acquire),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            panicked_tasks: self.panicked_tasks.load(Ordering::Relaxed),
            inline_runs: self.inline_runs.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
        }
    }

    /// Move one worker between the idle and active counts.
    pub fn worker_busy(&self, busy: bool) {
        if busy {
            self.worker_idle.fetch_sub(1, Ordering::AcqRel);
            self.worker_active.fetch_add(1, Ordering::AcqRel);
        } else {
            self.worker_active.fetch_sub(1, Ordering::AcqRel);
            self.worker_idle.fetch_add(1, Ordering::AcqRel);
        }
    }
}
