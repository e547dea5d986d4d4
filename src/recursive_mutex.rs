//! Recursive tracked mutex
//!
//! A [`TrackedRecursiveMutex`] may be locked repeatedly by its owner; each
//! lock adds one level of depth and the mutex is released when the depth
//! returns to zero. The underlying [`TrackedMutex`] is only taken on the
//! outermost lock, so the registry sees one acquisition per ownership period.
//!
//! The mutex also carries an explicit lifecycle. Using it before
//! [`initialize`](TrackedRecursiveMutex::initialize), after
//! [`destroy`](TrackedRecursiveMutex::destroy), destroying it twice or
//! destroying it while held are contract violations: they are logged and the
//! process aborts.
//!
//! # Examples
//!
//! ```
//! use lockgraph::{ThreadKey, TrackedRecursiveMutex};
//!
//! let mutex = TrackedRecursiveMutex::new();
//! let me = ThreadKey::current();
//!
//! mutex.lock(me).unwrap();
//! mutex.lock(me).unwrap();
//! assert_eq!(mutex.depth(), 2);
//!
//! mutex.unlock(me).unwrap();
//! mutex.unlock(me).unwrap();
//! assert!(!mutex.is_locked());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::error;

use crate::core::error::LockError;
use crate::core::registry::LockTracker;
use crate::mutex::TrackedMutex;
use crate::util::{MutexId, ThreadKey};

/// Lifecycle of a [`TrackedRecursiveMutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed with [`TrackedRecursiveMutex::new_uninit`], not yet usable.
    Uninitialized,
    /// Usable.
    Initialized,
    /// Torn down; any further use is a contract violation.
    Destroyed,
}

impl Lifecycle {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Initialized => 1,
            Self::Destroyed => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            _ => Self::Destroyed,
        }
    }
}

fn contract_violation(what: &'static str, mutex: MutexId) -> ! {
    error!(%mutex, violation = what, "Recursive mutex contract violated, aborting");
    std::process::abort()
}

/// Re-entrant mutex tracked by the lock registry.
pub struct TrackedRecursiveMutex {
    inner: TrackedMutex,
    depth: AtomicUsize,
    lifecycle: AtomicU8,
}

impl TrackedRecursiveMutex {
    /// Creates an initialized, unlocked mutex on the process-wide registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: TrackedMutex::new(),
            depth: AtomicUsize::new(0),
            lifecycle: AtomicU8::new(Lifecycle::Initialized.as_u8()),
        }
    }

    /// Creates a mutex that must be [`initialize`](Self::initialize)d before use.
    #[must_use]
    pub const fn new_uninit() -> Self {
        Self {
            inner: TrackedMutex::new(),
            depth: AtomicUsize::new(0),
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized.as_u8()),
        }
    }

    /// Creates an initialized mutex reporting to `tracker`.
    #[must_use]
    pub fn with_tracker(tracker: Arc<dyn LockTracker>) -> Self {
        Self {
            inner: TrackedMutex::with_tracker(tracker),
            depth: AtomicUsize::new(0),
            lifecycle: AtomicU8::new(Lifecycle::Initialized.as_u8()),
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Moves an uninitialized or destroyed mutex to `Initialized`.
    ///
    /// Initializing an already initialized mutex aborts the process.
    pub fn initialize(&self) {
        let swapped = self.lifecycle.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            (Lifecycle::from_u8(raw) != Lifecycle::Initialized)
                .then_some(Lifecycle::Initialized.as_u8())
        });
        if swapped.is_err() {
            contract_violation("initialize on initialized mutex", self.id());
        }
        self.depth.store(0, Ordering::Release);
    }

    /// Tears the mutex down.
    ///
    /// Destroying twice, destroying an uninitialized mutex, or destroying
    /// while any thread holds it aborts the process.
    pub fn destroy(&self) {
        match self.lifecycle() {
            Lifecycle::Initialized => {}
            Lifecycle::Uninitialized => contract_violation("destroy before initialize", self.id()),
            Lifecycle::Destroyed => contract_violation("double destroy", self.id()),
        }
        if self.inner.is_locked() {
            contract_violation("destroy while locked", self.id());
        }
        self.lifecycle
            .store(Lifecycle::Destroyed.as_u8(), Ordering::Release);
    }

    fn ensure_usable(&self) {
        match self.lifecycle() {
            Lifecycle::Initialized => {}
            Lifecycle::Uninitialized => contract_violation("use before initialize", self.id()),
            Lifecycle::Destroyed => contract_violation("use after destroy", self.id()),
        }
    }

    fn reenter(&self, thread: ThreadKey) -> bool {
        if self.inner.is_owned_by_thread(thread) {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// Locks, or deepens the lock if `thread` already owns it.
    ///
    /// # Errors
    ///
    /// `WouldDeadlock` / `ResourceExhausted` from the registry on the
    /// outermost acquisition.
    pub fn lock(&self, thread: ThreadKey) -> Result<(), LockError> {
        self.ensure_usable();
        if self.reenter(thread) {
            return Ok(());
        }
        self.inner.lock(thread)?;
        self.depth.store(1, Ordering::Release);
        Ok(())
    }

    /// Non-blocking variant of [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// `AlreadyLocked` when another thread holds it.
    pub fn try_lock(&self, thread: ThreadKey) -> Result<(), LockError> {
        self.ensure_usable();
        if self.reenter(thread) {
            return Ok(());
        }
        self.inner.try_lock(thread)?;
        self.depth.store(1, Ordering::Release);
        Ok(())
    }

    /// Bounded variant of [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// `TimedOut` when the wait elapsed.
    pub fn try_lock_for(&self, thread: ThreadKey, timeout: Duration) -> Result<(), LockError> {
        self.ensure_usable();
        if self.reenter(thread) {
            return Ok(());
        }
        self.inner.try_lock_for(thread, timeout)?;
        self.depth.store(1, Ordering::Release);
        Ok(())
    }

    /// Deadline variant of [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// `TimedOut` when the deadline passed.
    pub fn try_lock_until(&self, thread: ThreadKey, deadline: Instant) -> Result<(), LockError> {
        self.ensure_usable();
        if self.reenter(thread) {
            return Ok(());
        }
        self.inner.try_lock_until(thread, deadline)?;
        self.depth.store(1, Ordering::Release);
        Ok(())
    }

    /// Removes one level of depth; releases the mutex at depth zero.
    ///
    /// # Errors
    ///
    /// `NotOwner` if `thread` does not hold the mutex. Depth is unchanged.
    pub fn unlock(&self, thread: ThreadKey) -> Result<(), LockError> {
        self.ensure_usable();
        if !self.inner.is_owned_by_thread(thread) {
            return Err(LockError::NotOwner(thread));
        }
        if self.depth.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        self.inner.unlock(thread)
    }

    /// Lock depth held by the current owner (0 when unlocked).
    pub fn depth(&self) -> usize {
        if self.inner.is_locked() {
            self.depth.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Whether `thread` owns the mutex.
    pub fn is_owned_by_thread(&self, thread: ThreadKey) -> bool {
        self.inner.is_owned_by_thread(thread)
    }

    /// Whether any thread owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Registry identity.
    pub fn id(&self) -> MutexId {
        self.inner.id()
    }
}

impl Default for TrackedRecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrackedRecursiveMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRecursiveMutex")
            .field("id", &self.id())
            .field("lifecycle", &self.lifecycle())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::LockRegistry;
    use std::thread;

    #[test]
    fn test_depth_tracking() {
        let registry = Arc::new(LockRegistry::new());
        let mutex = TrackedRecursiveMutex::with_tracker(registry.clone());
        let me = ThreadKey::current();

        for expected in 1..=3 {
            mutex.lock(me).unwrap();
            assert_eq!(mutex.depth(), expected);
        }
        assert_eq!(registry.owned_mutexes(me), vec![mutex.id()]);

        for expected in (0..3).rev() {
            mutex.unlock(me).unwrap();
            assert_eq!(mutex.depth(), expected);
        }
        assert!(!mutex.is_locked());
        assert!(registry.owned_mutexes(me).is_empty());
    }

    #[test]
    fn test_non_owner_unlock_leaves_state() {
        let registry = Arc::new(LockRegistry::new());
        let mutex = Arc::new(TrackedRecursiveMutex::with_tracker(registry));
        let me = ThreadKey::current();
        mutex.lock(me).unwrap();
        mutex.lock(me).unwrap();

        let mutex2 = Arc::clone(&mutex);
        let (them, result) = thread::spawn(move || {
            let them = ThreadKey::current();
            (them, mutex2.unlock(them))
        })
        .join()
        .unwrap();

        assert_eq!(result, Err(LockError::NotOwner(them)));
        assert_eq!(mutex.depth(), 2);
        mutex.unlock(me).unwrap();
        mutex.unlock(me).unwrap();
    }

    #[test]
    fn test_try_lock_reenters() {
        let mutex = TrackedRecursiveMutex::with_tracker(Arc::new(LockRegistry::new()));
        let me = ThreadKey::current();
        mutex.try_lock(me).unwrap();
        mutex.try_lock_for(me, Duration::from_millis(1)).unwrap();
        assert_eq!(mutex.depth(), 2);
        mutex.unlock(me).unwrap();
        mutex.unlock(me).unwrap();
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mutex = TrackedRecursiveMutex::new_uninit();
        assert_eq!(mutex.lifecycle(), Lifecycle::Uninitialized);
        mutex.initialize();
        assert_eq!(mutex.lifecycle(), Lifecycle::Initialized);
        mutex.destroy();
        assert_eq!(mutex.lifecycle(), Lifecycle::Destroyed);
        mutex.initialize();
        assert_eq!(mutex.lifecycle(), Lifecycle::Initialized);
    }
}
