//! Process-unique identities for threads and tracked mutexes.
//!
//! The lock registry never looks at native handles or pointers. Every thread
//! that touches the locking core gets a [`ThreadKey`], and every tracked mutex
//! gets a [`MutexId`]. Both are non-zero so that `0` can stand for "unknown"
//! inside atomics.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_KEY: ThreadKey = ThreadKey::allocate();
}

/// Identity of a thread as seen by the lock registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey(NonZeroU64);

impl ThreadKey {
    /// Key of the calling thread, assigned on first use.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_THREAD_KEY.with(|key| *key)
    }

    /// Rebuild a key from its raw value. Returns `None` for `0`.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw value, suitable for storing in an atomic.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }

    fn allocate() -> Self {
        let raw = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
        // Wrapping past u64::MAX would take centuries of thread creation.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Identity of a tracked mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutexId(NonZeroU64);

impl MutexId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        let raw = NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild an id from its raw value. Returns `None` for `0`.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw value, suitable for storing in an atomic.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex#{}", self.0)
    }
}

/// An id slot that is filled the first time it is read.
///
/// Lets tracked mutexes keep a `const fn new` for use in statics.
#[derive(Debug, Default)]
pub(crate) struct LazyMutexId(AtomicU64);

impl LazyMutexId {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn get(&self) -> MutexId {
        if let Some(id) = MutexId::from_raw(self.0.load(Ordering::Acquire)) {
            return id;
        }
        let fresh = MutexId::next();
        match self
            .0
            .compare_exchange(0, fresh.as_u64(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(existing) => MutexId::from_raw(existing).unwrap_or(fresh),
        }
    }
}
