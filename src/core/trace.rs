//! Task lifecycle tracing.
//!
//! The scheduler reports every step of a task's life as a [`TraceEvent`]:
//! submission, queue handoff, start and finish on a worker, and for timed
//! tasks the timer registration and trigger. Events go to every registered
//! [`TraceSink`] and are also emitted as `tracing` records at trace level.
//!
//! Spans link nested work. A worker runs each task body inside a
//! [`SpanScope`], so anything submitted from that body records the running
//! task as its parent.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use crate::util::{clock, ThreadKey};

/// Label of tasks submitted for immediate execution.
pub const TRACE_LABEL_SUBMIT: &str = "task_scheduler.submit";
/// Label of one-shot delayed tasks.
pub const TRACE_LABEL_SCHEDULE_ONCE: &str = "task_scheduler.schedule_once";
/// Label of periodic tasks.
pub const TRACE_LABEL_SCHEDULE_EVERY: &str = "task_scheduler.schedule_every";

/// Step in a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    /// Handed to the scheduler.
    Submitted,
    /// Pushed onto the immediate queue.
    Enqueued,
    /// Taken off the queue by a worker.
    Dequeued,
    /// Body about to run.
    Started,
    /// Body returned (or panicked).
    Finished,
    /// Scheduled entry cancelled before it ran.
    Cancelled,
    /// Entry inserted into the timer heap.
    TimerRegistered,
    /// Timer thread found the entry due.
    TimerTriggered,
}

impl fmt::Display for TracePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Enqueued => "enqueued",
            Self::Dequeued => "dequeued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::TimerRegistered => "timer_registered",
            Self::TimerTriggered => "timer_triggered",
        };
        f.write_str(name)
    }
}

/// One lifecycle observation.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Span of the task.
    pub span_id: u64,
    /// Span that was current when the task was created.
    pub parent_id: Option<u64>,
    /// One of the `TRACE_LABEL_*` constants.
    pub label: &'static str,
    /// What happened.
    pub phase: TracePhase,
    /// Emitted from the scheduler's timer thread.
    pub timer_thread: bool,
    /// Emitting thread.
    pub thread: ThreadKey,
    /// Monotonic emission time.
    #[serde(skip)]
    pub timestamp: Instant,
    /// Wall-clock emission time, milliseconds since the Unix epoch.
    pub timestamp_ms: u128,
    /// Immediate queue depth at emission.
    pub queue_depth: usize,
    /// Timer heap depth at emission.
    pub scheduled_depth: usize,
    /// Workers running a task.
    pub worker_active: usize,
    /// Workers waiting for a task.
    pub worker_idle: usize,
}

/// Scheduler state sampled into each event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthSample {
    /// Immediate queue depth.
    pub queue_depth: usize,
    /// Timer heap depth.
    pub scheduled_depth: usize,
    /// Active workers.
    pub worker_active: usize,
    /// Idle workers.
    pub worker_idle: usize,
}

impl TraceEvent {
    /// Build an event stamped with the current thread and time.
    pub fn new(
        span_id: u64,
        parent_id: Option<u64>,
        label: &'static str,
        phase: TracePhase,
        timer_thread: bool,
        depths: DepthSample,
    ) -> Self {
        Self {
            span_id,
            parent_id,
            label,
            phase,
            timer_thread,
            thread: ThreadKey::current(),
            timestamp: clock::now(),
            timestamp_ms: clock::now_ms(),
            queue_depth: depths.queue_depth,
            scheduled_depth: depths.scheduled_depth,
            worker_active: depths.worker_active,
            worker_idle: depths.worker_idle,
        }
    }
}

/// Receiver of trace events. Called synchronously on the emitting thread.
pub trait TraceSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &TraceEvent);
}

impl<F> TraceSink for F
where
    F: Fn(&TraceEvent) + Send + Sync,
{
    fn on_event(&self, event: &TraceEvent) {
        self(event);
    }
}

/// Registration token returned by [`register_trace_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

type SinkTable = RwLock<Vec<(SinkId, Arc<dyn TraceSink>)>>;

static NEXT_SPAN: AtomicU64 = AtomicU64::new(1);
static NEXT_SINK: AtomicU64 = AtomicU64::new(1);

fn sinks() -> &'static SinkTable {
    static SINKS: OnceLock<SinkTable> = OnceLock::new();
    SINKS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Add a sink that receives every subsequent event.
pub fn register_trace_sink(sink: Arc<dyn TraceSink>) -> SinkId {
    let id = SinkId(NEXT_SINK.fetch_add(1, Ordering::Relaxed));
    sinks().write().push((id, sink));
    id
}

/// Remove a sink. Returns `false` if `id` was not registered.
pub fn unregister_trace_sink(id: SinkId) -> bool {
    let mut table = sinks().write();
    let before = table.len();
    table.retain(|(sink_id, _)| *sink_id != id);
    table.len() != before
}

/// Deliver `event` to the log and to all sinks.
pub fn emit(event: &TraceEvent) {
    trace!(
        span_id = event.span_id,
        parent_id = ?event.parent_id,
        label = event.label,
        phase = %event.phase,
        timer_thread = event.timer_thread,
        thread = %event.thread,
        queue_depth = event.queue_depth,
        scheduled_depth = event.scheduled_depth,
        "task trace"
    );
    // Sinks run outside the table lock so they may (un)register sinks.
    let snapshot: Vec<Arc<dyn TraceSink>> =
        sinks().read().iter().map(|(_, sink)| Arc::clone(sink)).collect();
    for sink in snapshot {
        sink.on_event(event);
    }
}

/// Fresh, process-unique, non-zero span id.
pub fn generate_span_id() -> u64 {
    NEXT_SPAN.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT_SPAN: Cell<u64> = const { Cell::new(0) };
}

/// Make `span_id` current on this thread and return the previous span (0 for none).
pub fn push_span(span_id: u64) -> u64 {
    CURRENT_SPAN.with(|current| current.replace(span_id))
}

/// Restore the span returned by the matching [`push_span`].
pub fn pop_span(previous: u64) {
    CURRENT_SPAN.with(|current| current.set(previous));
}

/// Span currently active on this thread.
pub fn current_span() -> Option<u64> {
    let span = CURRENT_SPAN.with(Cell::get);
    (span != 0).then_some(span)
}

/// Keeps a span current for its lifetime.
#[derive(Debug)]
#[must_use = "the span is popped when the scope is dropped"]
pub struct SpanScope {
    previous: u64,
}

impl SpanScope {
    /// Enter `span_id` on this thread.
    pub fn enter(span_id: u64) -> Self {
        Self {
            previous: push_span(span_id),
        }
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        pop_span(self.previous);
    }
}
