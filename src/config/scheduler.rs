//! Task scheduler configuration.

use std::env;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::error::AppResult;
use crate::infra::queue::DEFAULT_TIMER_CAPACITY;

/// Default worker stack size (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Scheduler sizing and thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; 0 means one per available CPU.
    pub worker_count: usize,
    /// Bound on the immediate queue; `None` for unbounded.
    pub max_queue_depth: Option<usize>,
    /// Bound on pending timed entries.
    pub max_scheduled_tasks: usize,
    /// Stack size of worker and timer threads, in bytes.
    pub thread_stack_size: usize,
    /// Prefix of worker and timer thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_queue_depth: None,
            max_scheduled_tasks: DEFAULT_TIMER_CAPACITY,
            thread_stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: "lockgraph".into(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults: one worker per CPU, unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count (0 for one per CPU).
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Bound the immediate queue.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Bound the timer heap.
    #[must_use]
    pub const fn with_max_scheduled_tasks(mut self, max: usize) -> Self {
        self.max_scheduled_tasks = max;
        self
    }

    /// Set the thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Worker count after resolving 0 to the CPU count.
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_depth == Some(0) {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.max_scheduled_tasks == 0 {
            return Err("max_scheduled_tasks must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse from a JSON string and validate. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build from `LOCKGRAPH_*` environment variables, loading a `.env`
    /// file first if one exists.
    ///
    /// Recognized: `LOCKGRAPH_WORKERS`, `LOCKGRAPH_MAX_QUEUE_DEPTH`,
    /// `LOCKGRAPH_MAX_SCHEDULED`, `LOCKGRAPH_STACK_SIZE`,
    /// `LOCKGRAPH_THREAD_PREFIX`.
    ///
    /// # Errors
    ///
    /// A variable that does not parse, or a validation failure.
    pub fn from_env() -> AppResult<Self> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();
        if let Some(workers) = parse_var("LOCKGRAPH_WORKERS")? {
            cfg.worker_count = workers;
        }
        if let Some(depth) = parse_var("LOCKGRAPH_MAX_QUEUE_DEPTH")? {
            cfg.max_queue_depth = Some(depth);
        }
        if let Some(max) = parse_var("LOCKGRAPH_MAX_SCHEDULED")? {
            cfg.max_scheduled_tasks = max;
        }
        if let Some(bytes) = parse_var("LOCKGRAPH_STACK_SIZE")? {
            cfg.thread_stack_size = bytes;
        }
        if let Ok(prefix) = env::var("LOCKGRAPH_THREAD_PREFIX") {
            cfg.thread_name_prefix = prefix;
        }
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

fn parse_var<T>(name: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}
