//! Configuration models for the task scheduler.

pub mod scheduler;

pub use scheduler::{SchedulerConfig, DEFAULT_STACK_SIZE};
