//! Waiter diagnostics for external deadlock and health monitoring.
//!
//! Reads [`LockTracker::snapshot_waiters`] only; nothing here takes part in
//! the locking fast path.

use std::time::Duration;

use tracing::warn;

use crate::core::registry::{LockTracker, WaiterSnapshot};

/// Waiters that have been blocked for at least `threshold`, each logged at
/// warn level.
pub fn long_waiters(tracker: &dyn LockTracker, threshold: Duration) -> Vec<WaiterSnapshot> {
    let stuck: Vec<WaiterSnapshot> = tracker
        .snapshot_waiters()
        .into_iter()
        .filter(|waiter| waiter.waited() >= threshold)
        .collect();

    for waiter in &stuck {
        warn!(
            mutex = %waiter.mutex,
            waiting_thread = %waiter.waiting_thread,
            owner_thread = ?waiter.owner_thread.map(|t| t.as_u64()),
            waited_ms = waiter.waited_ms,
            "Thread waiting on mutex longer than threshold"
        );
    }
    stuck
}

/// Current waiters rendered as a JSON array.
///
/// # Errors
///
/// Propagates `serde_json` serialization failures.
pub fn waiters_json(tracker: &dyn LockTracker) -> Result<String, serde_json::Error> {
    serde_json::to_string(&tracker.snapshot_waiters())
}
