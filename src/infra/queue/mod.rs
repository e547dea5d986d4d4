//! Queue primitives used by the scheduler.

pub mod blocking;
pub mod timer_heap;

pub use blocking::BlockingQueue;
pub use timer_heap::{TimerHeap, DEFAULT_TIMER_CAPACITY};
