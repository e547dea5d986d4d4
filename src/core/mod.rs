//! Lock registry, deadlock prediction, diagnostics and the task scheduler.

pub mod error;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod span_metrics;
pub mod trace;

pub use error::{AppResult, LockError, PushError, QueueError, RegistryError, SchedulerError, TaskError};
pub use monitor::{long_waiters, waiters_json};
pub use registry::{install_global, LockRegistry, LockTracker, WaiterSnapshot};
pub use scheduler::{ScheduledTaskHandle, SchedulerStats, TaskFuture, TaskScheduler};
pub use span_metrics::{SpanCollector, SpanExporter, SpanMetrics};
pub use trace::{
    current_span, generate_span_id, pop_span, push_span, register_trace_sink,
    unregister_trace_sink, SinkId, SpanScope, TraceEvent, TracePhase, TraceSink,
    TRACE_LABEL_SCHEDULE_EVERY, TRACE_LABEL_SCHEDULE_ONCE, TRACE_LABEL_SUBMIT,
};
