//! # lockgraph
//!
//! Deadlock-predicting mutexes and a worker-pool task scheduler built on them.
//!
//! Every tracked mutex reports to a process-wide lock registry: who owns
//! which mutex, and which mutex each blocked thread is waiting for. Before a
//! thread blocks, the registry walks the wait-for graph; if blocking would
//! close a cycle, the lock attempt fails with `LockError::WouldDeadlock`
//! instead of hanging forever.
//!
//! ## Key Features
//!
//! - **Deadlock prediction**: cycle detection on every blocking acquisition
//! - **Self-deadlock avoidance**: relocking a held mutex fails immediately
//! - **Recursive variant** with explicit lifecycle
//! - **Condition variable** whose relock goes through the same prediction
//! - **Task scheduler**: worker threads, delayed and periodic tasks, result
//!   futures, inline fallback when a handoff is refused
//! - **Tracing**: task lifecycle events, span linking and per-span metrics
//!
//! ## Tracked mutex
//!
//! ```
//! use lockgraph::{LockError, ThreadKey, TrackedMutex};
//!
//! let mutex = TrackedMutex::new();
//! let me = ThreadKey::current();
//!
//! mutex.lock(me)?;
//! assert_eq!(mutex.lock(me), Err(LockError::AlreadyLocked));
//! mutex.unlock(me)?;
//! # Ok::<(), LockError>(())
//! ```
//!
//! ## Task scheduler
//!
//! ```
//! use lockgraph::config::SchedulerConfig;
//! use lockgraph::core::TaskScheduler;
//! use std::time::Duration;
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::new().with_worker_count(4))?;
//!
//! let future = scheduler.submit(|| 2 + 2);
//! assert_eq!(future.wait_timeout(Duration::from_secs(5)).unwrap(), 4);
//!
//! let ticker = scheduler.schedule_every(Duration::from_millis(50), || {});
//! ticker.cancel();
//! # Ok::<(), lockgraph::core::SchedulerError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration models for the task scheduler.
pub mod config;
/// Lock registry, diagnostics, tracing and the task scheduler.
pub mod core;
/// Native lock primitive and queue storage.
pub mod infra;
/// Shared utilities: identities, clock, logging setup.
pub mod util;

mod condvar;
mod mutex;
mod recursive_mutex;

pub use condvar::TrackedCondvar;
pub use crate::core::error::LockError;
pub use mutex::{Guarded, GuardedRef, TrackedMutex};
pub use recursive_mutex::{Lifecycle, TrackedRecursiveMutex};
pub use util::{MutexId, ThreadKey};
