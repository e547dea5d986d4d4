//! Native mutual-exclusion primitive underneath the tracked mutexes.
//!
//! A binary lock whose ownership is not tied to a guard lifetime, so that
//! `lock` and `unlock` can be separate calls. Built from a `parking_lot`
//! mutex/condvar pair; the flag is only flipped while the inner mutex is held.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Binary lock with blocking, non-blocking and deadline acquisition.
#[derive(Debug, Default)]
pub struct NativeLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl NativeLock {
    /// Creates an unlocked primitive.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Blocks until the lock is acquired.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    /// Acquires without blocking. Returns `false` if the lock is held.
    pub fn try_acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    /// Acquires, giving up at `deadline`. Returns `false` on timeout.
    pub fn try_acquire_until(&self, deadline: Instant) -> bool {
        let mut held = self.held.lock();
        while *held {
            if self.released.wait_until(&mut held, deadline).timed_out() {
                if *held {
                    return false;
                }
                break;
            }
        }
        *held = true;
        true
    }

    /// Releases the lock and wakes one waiter. Returns `false` if it was not held.
    pub fn release(&self) -> bool {
        let mut held = self.held.lock();
        if !*held {
            return false;
        }
        *held = false;
        drop(held);
        self.released.notify_one();
        true
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}
