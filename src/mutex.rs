//! Tracked mutex implementation
//!
//! [`TrackedMutex`] is a mutual-exclusion primitive that asks the lock
//! registry before it blocks. If waiting would close a cycle in the wait-for
//! graph, `lock` fails immediately instead of deadlocking.
//!
//! # Features
//!
//! - Self-deadlock avoidance: relocking from the owner returns `AlreadyLocked`
//! - Predicted-deadlock refusal across threads
//! - Non-blocking and timed attempts
//! - Every state change mirrored into the registry
//!
//! # Examples
//!
//! ```
//! use lockgraph::{ThreadKey, TrackedMutex};
//!
//! let mutex = TrackedMutex::new();
//! let me = ThreadKey::current();
//!
//! mutex.lock(me).unwrap();
//! assert!(mutex.is_owned_by_thread(me));
//! // A second lock from the owner never blocks.
//! assert!(mutex.lock(me).is_err());
//! mutex.unlock(me).unwrap();
//! ```
//!
//! Guarding data:
//!
//! ```
//! use lockgraph::{Guarded, ThreadKey};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let counter = Arc::new(Guarded::new(0));
//! let mut handles = vec![];
//!
//! for _ in 0..10 {
//!     let counter = Arc::clone(&counter);
//!     handles.push(thread::spawn(move || {
//!         let mut value = counter.lock(ThreadKey::current()).unwrap();
//!         *value += 1;
//!     }));
//! }
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(*counter.lock(ThreadKey::current()).unwrap(), 10);
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, trace};

use crate::core::error::LockError;
use crate::core::registry::{self, LockTracker};
use crate::infra::native::NativeLock;
use crate::util::ids::LazyMutexId;
use crate::util::{clock, MutexId, ThreadKey};

/// A mutex whose ownership is tracked in a [`LockTracker`].
pub struct TrackedMutex {
    native: NativeLock,
    locked: AtomicBool,
    owner: AtomicU64,
    id: LazyMutexId,
    tracker: Option<Arc<dyn LockTracker>>,
}

impl TrackedMutex {
    /// Creates an unlocked mutex reporting to the process-wide registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            native: NativeLock::new(),
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            id: LazyMutexId::new(),
            tracker: None,
        }
    }

    /// Creates an unlocked mutex reporting to `tracker` instead of the
    /// process-wide registry.
    #[must_use]
    pub fn with_tracker(tracker: Arc<dyn LockTracker>) -> Self {
        Self {
            native: NativeLock::new(),
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            id: LazyMutexId::new(),
            tracker: Some(tracker),
        }
    }

    /// Registry identity of this mutex.
    pub fn id(&self) -> MutexId {
        self.id.get()
    }

    fn tracker(&self) -> &dyn LockTracker {
        match &self.tracker {
            Some(tracker) => tracker.as_ref(),
            None => registry::global().as_ref(),
        }
    }

    /// Blocks until `thread` owns the mutex.
    ///
    /// # Errors
    ///
    /// - `AlreadyLocked` if `thread` already owns it (never blocks)
    /// - `WouldDeadlock` if waiting would close a wait-for cycle (never blocks)
    /// - `ResourceExhausted` if registry bookkeeping could not be allocated
    pub fn lock(&self, thread: ThreadKey) -> Result<(), LockError> {
        if self.is_owned_by_thread(thread) {
            return Err(LockError::AlreadyLocked);
        }
        let id = self.id();
        let tracker = self.tracker();
        let owned = tracker.owned_mutexes(thread);
        tracker.record_wait(thread, id, &owned)?;
        self.native.acquire();
        self.finish_acquire(tracker, thread, id)
    }

    /// Acquires only if the mutex is free right now.
    ///
    /// # Errors
    ///
    /// `AlreadyLocked` if held (by anyone), plus the registry outcomes of [`lock`](Self::lock).
    pub fn try_lock(&self, thread: ThreadKey) -> Result<(), LockError> {
        if self.is_owned_by_thread(thread) {
            return Err(LockError::AlreadyLocked);
        }
        let id = self.id();
        let tracker = self.tracker();
        let owned = tracker.owned_mutexes(thread);
        tracker.record_wait(thread, id, &owned)?;
        if !self.native.try_acquire() {
            tracker.cancel_wait(thread, id);
            return Err(LockError::AlreadyLocked);
        }
        self.finish_acquire(tracker, thread, id)
    }

    /// Acquires, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// `TimedOut` if the native wait elapsed, plus the outcomes of [`lock`](Self::lock).
    pub fn try_lock_for(&self, thread: ThreadKey, timeout: Duration) -> Result<(), LockError> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.try_lock_until(thread, clock::add_ms(clock::now(), millis.max(1)))
    }

    /// Acquires, waiting until `deadline` at the latest.
    ///
    /// Only the native wait is bounded; the registry check itself never blocks.
    ///
    /// # Errors
    ///
    /// `TimedOut` if the deadline passed, plus the outcomes of [`lock`](Self::lock).
    pub fn try_lock_until(&self, thread: ThreadKey, deadline: Instant) -> Result<(), LockError> {
        if self.is_owned_by_thread(thread) {
            return Err(LockError::AlreadyLocked);
        }
        let id = self.id();
        let tracker = self.tracker();
        let owned = tracker.owned_mutexes(thread);
        tracker.record_wait(thread, id, &owned)?;
        if !self.native.try_acquire_until(deadline) {
            tracker.cancel_wait(thread, id);
            trace!(%thread, mutex = %id, "Timed lock attempt expired");
            return Err(LockError::TimedOut);
        }
        self.finish_acquire(tracker, thread, id)
    }

    fn finish_acquire(
        &self,
        tracker: &dyn LockTracker,
        thread: ThreadKey,
        id: MutexId,
    ) -> Result<(), LockError> {
        if let Err(err) = tracker.record_acquired(thread, id) {
            self.native.release();
            tracker.cancel_wait(thread, id);
            return Err(err);
        }
        self.owner.store(thread.as_u64(), Ordering::Release);
        self.locked.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases the mutex held by `thread`.
    ///
    /// # Errors
    ///
    /// `NotOwner` if `thread` does not hold it; nothing is changed in that case.
    pub fn unlock(&self, thread: ThreadKey) -> Result<(), LockError> {
        if !self.locked.load(Ordering::Acquire) {
            return Err(LockError::NotOwner(thread));
        }
        let id = self.id();
        let tracker = self.tracker();
        let owner = self.owner.load(Ordering::Acquire);
        let owned = if owner == 0 {
            tracker.owned_mutexes(thread).contains(&id)
        } else {
            owner == thread.as_u64()
        };
        if !owned {
            return Err(LockError::NotOwner(thread));
        }

        // Registry and flags drop ownership before the native lock opens, so
        // the next owner can never be recorded while we still are.
        self.locked.store(false, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        tracker.record_released(thread, id);
        if !self.native.release() {
            error!(%thread, mutex = %id, "Native lock was not held during unlock");
            return Err(LockError::InvalidState("native lock not held"));
        }
        Ok(())
    }

    /// Whether `thread` currently owns the mutex.
    pub fn is_owned_by_thread(&self, thread: ThreadKey) -> bool {
        self.locked.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == thread.as_u64()
    }

    /// Whether any thread currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Current owner, if locked.
    pub fn owner(&self) -> Option<ThreadKey> {
        if !self.is_locked() {
            return None;
        }
        ThreadKey::from_raw(self.owner.load(Ordering::Acquire))
    }
}

impl Default for TrackedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrackedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedMutex")
            .field("id", &self.id())
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

impl Drop for TrackedMutex {
    fn drop(&mut self) {
        // Dropped while held: the owner's registry row must not keep a dead id.
        if let Some(owner) = self.owner() {
            self.tracker().record_released(owner, self.id());
        }
    }
}

/// Data protected by a [`TrackedMutex`].
///
/// Locking goes through the tracked mutex (with deadlock prediction); the
/// inner `parking_lot` mutex is only ever taken by the tracked owner and so
/// never contends.
pub struct Guarded<T> {
    raw: TrackedMutex,
    data: Mutex<T>,
}

impl<T> Guarded<T> {
    /// Wraps `value`, reporting to the process-wide registry.
    pub const fn new(value: T) -> Self {
        Self {
            raw: TrackedMutex::new(),
            data: Mutex::new(value),
        }
    }

    /// Wraps `value`, reporting to `tracker`.
    pub fn with_tracker(value: T, tracker: Arc<dyn LockTracker>) -> Self {
        Self {
            raw: TrackedMutex::with_tracker(tracker),
            data: Mutex::new(value),
        }
    }

    /// Locks for `thread`, blocking unless that would deadlock.
    ///
    /// # Errors
    ///
    /// Same as [`TrackedMutex::lock`].
    pub fn lock(&self, thread: ThreadKey) -> Result<GuardedRef<'_, T>, LockError> {
        self.raw.lock(thread)?;
        Ok(self.guard_for(thread))
    }

    /// Locks for `thread` only if free.
    ///
    /// # Errors
    ///
    /// Same as [`TrackedMutex::try_lock`].
    pub fn try_lock(&self, thread: ThreadKey) -> Result<GuardedRef<'_, T>, LockError> {
        self.raw.try_lock(thread)?;
        Ok(self.guard_for(thread))
    }

    /// Locks for `thread`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`TrackedMutex::try_lock_for`].
    pub fn try_lock_for(
        &self,
        thread: ThreadKey,
        timeout: Duration,
    ) -> Result<GuardedRef<'_, T>, LockError> {
        self.raw.try_lock_for(thread, timeout)?;
        Ok(self.guard_for(thread))
    }

    fn guard_for(&self, thread: ThreadKey) -> GuardedRef<'_, T> {
        GuardedRef {
            data: self.data.lock(),
            release: RawRelease {
                mutex: &self.raw,
                thread,
                armed: true,
            },
        }
    }

    /// The tracked mutex underneath.
    pub const fn raw(&self) -> &TrackedMutex {
        &self.raw
    }

    /// Consumes the wrapper, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded").field("raw", &self.raw).finish_non_exhaustive()
    }
}

/// RAII access to [`Guarded`] data. Releases the tracked mutex on drop.
pub struct GuardedRef<'a, T> {
    // Field order is drop order: data first, then the tracked mutex.
    pub(crate) data: MutexGuard<'a, T>,
    pub(crate) release: RawRelease<'a>,
}

impl<T> GuardedRef<'_, T> {
    /// Thread that owns this guard.
    pub const fn thread(&self) -> ThreadKey {
        self.release.thread
    }

    /// Whether the guard still owns the tracked mutex (a failed relock after
    /// a condition wait leaves it detached).
    pub const fn is_attached(&self) -> bool {
        self.release.armed
    }
}

impl<T> Deref for GuardedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for GuardedRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

pub(crate) struct RawRelease<'a> {
    pub(crate) mutex: &'a TrackedMutex,
    pub(crate) thread: ThreadKey,
    pub(crate) armed: bool,
}

impl Drop for RawRelease<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.mutex.unlock(self.thread) {
            error!(thread = %self.thread, mutex = %self.mutex.id(), error = %err, "Failed to release guarded mutex");
        }
    }
}
