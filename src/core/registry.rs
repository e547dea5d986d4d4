//! Process-wide lock ownership registry and wait-for-graph cycle detection.
//!
//! Every tracked mutex reports three transitions here: "about to wait",
//! "acquired" and "released". Before a thread is allowed to block, the
//! registry walks the wait-for graph starting at the mutex it wants. If some
//! owner of that mutex is (transitively) waiting for a mutex the requester
//! already holds, blocking would deadlock and the request is refused.
//!
//! # Design
//!
//! - One table, one re-entrant lock (`parking_lot::ReentrantMutex`), so a
//!   thread that is already inside the registry can call back into it.
//! - Table rows are per thread and never removed.
//! - The cycle walk is a pure function over the locked table with an explicit
//!   stack and a `(mutex, thread)` visited set.
//! - Callers only see the narrow [`LockTracker`] surface, never the table.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::error::{LockError, RegistryError};
use crate::util::{clock, MutexId, ThreadKey};

/// Operations a tracked mutex needs from the ownership registry.
///
/// Implementations must serialize all mutation and must not block on
/// anything other than their own short internal lock.
pub trait LockTracker: Send + Sync + fmt::Debug {
    /// Record that `thread`, holding `owned`, is about to wait for `requested`.
    ///
    /// # Errors
    ///
    /// `LockError::WouldDeadlock` if waiting would close a cycle (no awaited
    /// marker is left behind), `LockError::ResourceExhausted` if the thread's
    /// row could not be allocated.
    fn record_wait(
        &self,
        thread: ThreadKey,
        requested: MutexId,
        owned: &[MutexId],
    ) -> Result<(), LockError>;

    /// Drop the awaited marker set by `record_wait` after an attempt that did
    /// not end in acquisition.
    fn cancel_wait(&self, thread: ThreadKey, requested: MutexId);

    /// Move `mutex` into `thread`'s owned set and clear its awaited slot.
    ///
    /// # Errors
    ///
    /// `LockError::ResourceExhausted` if the thread's row could not be allocated.
    fn record_acquired(&self, thread: ThreadKey, mutex: MutexId) -> Result<(), LockError>;

    /// Remove `mutex` from `thread`'s owned set.
    fn record_released(&self, thread: ThreadKey, mutex: MutexId);

    /// Mutexes currently owned by `thread`.
    fn owned_mutexes(&self, thread: ThreadKey) -> Vec<MutexId>;

    /// Every thread currently waiting, with the mutex it waits for and that
    /// mutex's presumed owner.
    fn snapshot_waiters(&self) -> Vec<WaiterSnapshot>;
}

/// One waiting thread, as reported by [`LockTracker::snapshot_waiters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaiterSnapshot {
    /// Mutex being waited for.
    pub mutex: MutexId,
    /// Thread currently owning it, if the registry knows one.
    pub owner_thread: Option<ThreadKey>,
    /// Thread doing the waiting.
    pub waiting_thread: ThreadKey,
    /// Monotonic instant the wait began.
    #[serde(skip)]
    pub wait_started_at: Instant,
    /// Milliseconds waited so far at snapshot time.
    pub waited_ms: u64,
}

impl WaiterSnapshot {
    /// How long the thread had been waiting when the snapshot was taken.
    #[must_use]
    pub const fn waited(&self) -> Duration {
        Duration::from_millis(self.waited_ms)
    }
}

#[derive(Debug, Clone)]
struct ThreadLockInfo {
    thread: ThreadKey,
    owned: HashSet<MutexId>,
    waiting_for: Option<MutexId>,
    wait_started: Option<Instant>,
}

impl ThreadLockInfo {
    fn new(thread: ThreadKey) -> Self {
        Self {
            thread,
            owned: HashSet::new(),
            waiting_for: None,
            wait_started: None,
        }
    }

    fn clear_wait(&mut self) {
        self.waiting_for = None;
        self.wait_started = None;
    }
}

#[derive(Debug, Default)]
struct RegistryTable {
    threads: Vec<ThreadLockInfo>,
    index: HashMap<ThreadKey, usize>,
}

impl RegistryTable {
    fn position(&self, thread: ThreadKey) -> Option<usize> {
        self.index.get(&thread).copied()
    }

    fn slot_for(&mut self, thread: ThreadKey) -> Result<usize, LockError> {
        if let Some(slot) = self.position(thread) {
            return Ok(slot);
        }
        self.threads
            .try_reserve(1)
            .map_err(|_| LockError::ResourceExhausted)?;
        self.index
            .try_reserve(1)
            .map_err(|_| LockError::ResourceExhausted)?;
        let slot = self.threads.len();
        self.threads.push(ThreadLockInfo::new(thread));
        self.index.insert(thread, slot);
        Ok(slot)
    }
}

/// Walks "owned by" and "waiting for" edges from `requested`. Returns true if
/// some thread reachable that way waits for a mutex `origin` owns.
fn detect_cycle(threads: &[ThreadLockInfo], origin: &ThreadLockInfo, requested: MutexId) -> bool {
    let mut pending = vec![requested];
    let mut visited: HashSet<(MutexId, ThreadKey)> = HashSet::new();

    while let Some(mutex) = pending.pop() {
        for info in threads {
            if info.thread == origin.thread || !info.owned.contains(&mutex) {
                continue;
            }
            let Some(next) = info.waiting_for else {
                continue;
            };
            if origin.owned.contains(&next) {
                return true;
            }
            if visited.insert((next, info.thread)) {
                pending.push(next);
            }
        }
    }
    false
}

/// Default [`LockTracker`]: a single table behind a re-entrant lock.
pub struct LockRegistry {
    table: ReentrantMutex<RefCell<RegistryTable>>,
}

impl LockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ReentrantMutex::new(RefCell::new(RegistryTable::default())),
        }
    }

    /// Number of threads that have ever touched this registry.
    #[must_use]
    pub fn tracked_threads(&self) -> usize {
        let guard = self.table.lock();
        let count = guard.borrow().threads.len();
        count
    }

    /// Mutex `thread` is currently waiting for, if any.
    #[must_use]
    pub fn awaited_by(&self, thread: ThreadKey) -> Option<MutexId> {
        let guard = self.table.lock();
        let table = guard.borrow();
        table
            .position(thread)
            .and_then(|slot| table.threads[slot].waiting_for)
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("tracked_threads", &self.tracked_threads())
            .finish()
    }
}

impl LockTracker for LockRegistry {
    fn record_wait(
        &self,
        thread: ThreadKey,
        requested: MutexId,
        owned: &[MutexId],
    ) -> Result<(), LockError> {
        let cycle = {
            let guard = self.table.lock();
            let mut table = guard.borrow_mut();
            let slot = table.slot_for(thread)?;
            {
                let info = &mut table.threads[slot];
                info.owned = owned.iter().copied().collect();
                info.waiting_for = Some(requested);
                info.wait_started = Some(clock::now());
            }
            let cycle = detect_cycle(&table.threads, &table.threads[slot], requested);
            if cycle {
                table.threads[slot].clear_wait();
            }
            cycle
        };

        if cycle {
            debug!(%thread, mutex = %requested, held = owned.len(), "Refusing wait: predicted deadlock");
            return Err(LockError::WouldDeadlock {
                mutex: requested,
                thread,
            });
        }
        Ok(())
    }

    fn cancel_wait(&self, thread: ThreadKey, requested: MutexId) {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        if let Some(slot) = table.position(thread) {
            let info = &mut table.threads[slot];
            if info.waiting_for == Some(requested) {
                info.clear_wait();
            }
        }
    }

    fn record_acquired(&self, thread: ThreadKey, mutex: MutexId) -> Result<(), LockError> {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        let slot = table.slot_for(thread)?;
        let info = &mut table.threads[slot];
        info.owned.insert(mutex);
        info.clear_wait();
        Ok(())
    }

    fn record_released(&self, thread: ThreadKey, mutex: MutexId) {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        if let Some(slot) = table.position(thread) {
            let info = &mut table.threads[slot];
            info.owned.remove(&mutex);
            if info.waiting_for == Some(mutex) {
                info.clear_wait();
            }
        }
    }

    fn owned_mutexes(&self, thread: ThreadKey) -> Vec<MutexId> {
        let guard = self.table.lock();
        let table = guard.borrow();
        table
            .position(thread)
            .map(|slot| table.threads[slot].owned.iter().copied().collect())
            .unwrap_or_default()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn snapshot_waiters(&self) -> Vec<WaiterSnapshot> {
        let now = clock::now();
        let guard = self.table.lock();
        let table = guard.borrow();
        table
            .threads
            .iter()
            .filter_map(|info| {
                let mutex = info.waiting_for?;
                let started = info.wait_started.unwrap_or(now);
                let owner_thread = table
                    .threads
                    .iter()
                    .find(|other| other.thread != info.thread && other.owned.contains(&mutex))
                    .map(|other| other.thread);
                Some(WaiterSnapshot {
                    mutex,
                    owner_thread,
                    waiting_thread: info.thread,
                    wait_started_at: started,
                    waited_ms: now.saturating_duration_since(started).as_millis() as u64,
                })
            })
            .collect()
    }
}

static GLOBAL_TRACKER: OnceLock<Arc<dyn LockTracker>> = OnceLock::new();

/// Install the process-wide tracker. Must run before any tracked mutex that
/// uses the global registry is first locked.
///
/// # Errors
///
/// `RegistryError::AlreadyInitialized` if a tracker is already in place.
pub fn install_global(tracker: Arc<dyn LockTracker>) -> Result<(), RegistryError> {
    GLOBAL_TRACKER
        .set(tracker)
        .map_err(|_| RegistryError::AlreadyInitialized)?;
    info!("Installed process-wide lock tracker");
    Ok(())
}

/// The process-wide tracker, creating a default [`LockRegistry`] on first use.
pub fn global() -> &'static Arc<dyn LockTracker> {
    GLOBAL_TRACKER.get_or_init(|| Arc::new(LockRegistry::new()))
}
