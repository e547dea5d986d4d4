//! FIFO handoff queue between producers and worker threads.
//!
//! One `parking_lot` mutex and one condvar serialize everything. Shutdown
//! refuses new items and wakes every waiter, but items already queued stay
//! poppable until drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::{PushError, QueueError};

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// Blocking FIFO queue with optional capacity.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: Option<usize>,
}

impl<T> BlockingQueue<T> {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Queue that rejects pushes beyond `capacity` (`None` for unbounded).
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Append `item` and wake one waiter.
    ///
    /// # Errors
    ///
    /// `Full` at capacity, `Shutdown` after [`shutdown`](Self::shutdown).
    /// Either way the item is handed back.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PushError::Shutdown(item));
        }
        if self.capacity.is_some_and(|cap| state.items.len() >= cap) {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking pop.
    ///
    /// # Errors
    ///
    /// `Empty` when nothing is queued.
    pub fn pop(&self) -> Result<T, QueueError> {
        self.state.lock().items.pop_front().ok_or(QueueError::Empty)
    }

    /// Block until an item is available.
    ///
    /// Returns `Shutdown` once the queue is shut down and drained, or
    /// `Stopped` once `running` reads false and nothing is queued.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn wait_pop(&self, running: &AtomicBool) -> Result<T, QueueError> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.shutdown {
                return Err(QueueError::Shutdown);
            }
            if !running.load(Ordering::Acquire) {
                return Err(QueueError::Stopped);
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`wait_pop`](Self::wait_pop) but gives up after `timeout` with
    /// `TimedOut`.
    ///
    /// # Errors
    ///
    /// `Shutdown`, `Stopped` or `TimedOut`.
    pub fn wait_pop_timeout(&self, running: &AtomicBool, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.shutdown {
                return Err(QueueError::Shutdown);
            }
            if !running.load(Ordering::Acquire) {
                return Err(QueueError::Stopped);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                    {
                        return Err(QueueError::TimedOut);
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Refuse further pushes and wake all waiters.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    /// Wake all waiters without changing state, so they re-check their
    /// running flag.
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }

    /// Queued item count.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Configured capacity.
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::new();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop().ok()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pop(), Err(QueueError::Empty));
    }

    #[test]
    fn test_capacity_rejects_with_item() {
        let queue = BlockingQueue::with_capacity_limit(Some(1));
        queue.push("a").unwrap();
        match queue.push("b") {
            Err(PushError::Full(item)) => assert_eq!(item, "b"),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shutdown_keeps_queued_items() {
        let queue = BlockingQueue::new();
        queue.push(1).unwrap();
        queue.shutdown();

        assert!(matches!(queue.push(2), Err(PushError::Shutdown(2))));
        let running = AtomicBool::new(true);
        assert_eq!(queue.wait_pop(&running), Ok(1));
        assert_eq!(queue.wait_pop(&running), Err(QueueError::Shutdown));
    }

    #[test]
    fn test_stopped_flag_ends_wait() {
        let queue = BlockingQueue::<u8>::new();
        let running = AtomicBool::new(false);
        assert_eq!(queue.wait_pop(&running), Err(QueueError::Stopped));
    }

    #[test]
    fn test_wait_pop_timeout() {
        let queue = BlockingQueue::<u8>::new();
        let running = AtomicBool::new(true);
        assert_eq!(
            queue.wait_pop_timeout(&running, Duration::from_millis(10)),
            Err(QueueError::TimedOut)
        );
    }

    #[test]
    fn test_shutdown_wakes_blocked_waiter() {
        let queue = Arc::new(BlockingQueue::<u8>::new());
        let queue2 = Arc::clone(&queue);
        let waiter = thread::spawn(move || {
            let running = AtomicBool::new(true);
            queue2.wait_pop(&running)
        });
        thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(QueueError::Shutdown));
    }
}
