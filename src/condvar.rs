//! Condition variable for tracked mutexes.
//!
//! [`TrackedCondvar`] pairs with a [`GuardedRef`]. Waiting releases the
//! tracked mutex (and its registry ownership), blocks until notified, then
//! reacquires through the full registry choreography, so a relock that would
//! close a wait-for cycle is refused like any other lock.
//!
//! Notifications bump a generation counter under the condvar's own mutex.
//! A waiter samples the generation before it lets go of the tracked mutex, so
//! a notify issued after the release can never be lost.

use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::error::LockError;
use crate::mutex::GuardedRef;

/// A condition variable for [`Guarded`](crate::Guarded) data.
///
/// # Examples
///
/// ```
/// use lockgraph::{Guarded, ThreadKey, TrackedCondvar};
/// use std::sync::Arc;
/// use std::thread;
///
/// let pair = Arc::new((Guarded::new(false), TrackedCondvar::new()));
/// let pair2 = Arc::clone(&pair);
///
/// thread::spawn(move || {
///     let (lock, cvar) = &*pair2;
///     let mut started = lock.lock(ThreadKey::current()).unwrap();
///     *started = true;
///     cvar.notify_one();
/// });
///
/// let (lock, cvar) = &*pair;
/// let mut started = lock.lock(ThreadKey::current()).unwrap();
/// while !*started {
///     cvar.wait(&mut started).unwrap();
/// }
/// ```
#[derive(Debug, Default)]
pub struct TrackedCondvar {
    generation: Mutex<u64>,
    signal: Condvar,
}

impl TrackedCondvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            signal: Condvar::new(),
        }
    }

    /// Blocks until notified. Spurious wakeups are possible; re-check the
    /// predicate in a loop.
    ///
    /// # Errors
    ///
    /// Propagates the release or relock failure of the tracked mutex. If the
    /// relock fails the guard is left detached: the data stays protected by
    /// its inner mutex but the tracked mutex is no longer held.
    pub fn wait<T>(&self, guard: &mut GuardedRef<'_, T>) -> Result<(), LockError> {
        self.park(guard, None).map(|_| ())
    }

    /// Blocks until notified or until `deadline`. Returns `true` if the wait
    /// timed out.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_until<T>(
        &self,
        guard: &mut GuardedRef<'_, T>,
        deadline: Instant,
    ) -> Result<bool, LockError> {
        self.park(guard, Some(deadline))
    }

    /// Blocks while `condition` holds.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_while<T, F>(
        &self,
        guard: &mut GuardedRef<'_, T>,
        mut condition: F,
    ) -> Result<(), LockError>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard)?;
        }
        Ok(())
    }

    fn park<T>(
        &self,
        guard: &mut GuardedRef<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<bool, LockError> {
        if !guard.release.armed {
            return Err(LockError::InvalidState("guard detached from its mutex"));
        }
        let mutex = guard.release.mutex;
        let thread = guard.release.thread;

        let (timed_out, relocked) = MutexGuard::unlocked(&mut guard.data, || {
            let mut generation = self.generation.lock();
            let observed = *generation;
            mutex.unlock(thread)?;

            let mut timed_out = false;
            while *generation == observed {
                match deadline {
                    Some(deadline) => {
                        if self.signal.wait_until(&mut generation, deadline).timed_out() {
                            timed_out = *generation == observed;
                            break;
                        }
                    }
                    None => self.signal.wait(&mut generation),
                }
            }
            drop(generation);
            Ok::<_, LockError>((timed_out, mutex.lock(thread)))
        })?;

        if let Err(err) = relocked {
            guard.release.armed = false;
            return Err(err);
        }
        Ok(timed_out)
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.bump();
        self.signal.notify_one();
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.bump();
        self.signal.notify_all();
    }

    fn bump(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
    }
}
