//! Infrastructure: the native lock primitive and queue storage.

pub mod native;
pub mod queue;

pub use native::NativeLock;
pub use queue::{BlockingQueue, TimerHeap};
