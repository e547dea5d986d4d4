//! Per-span timing metrics built from task trace events.
//!
//! [`SpanCollector`] is a [`TraceSink`] that remembers when each span was
//! submitted and started, and when the span finishes (or is cancelled) hands
//! a [`SpanMetrics`] record to a [`SpanExporter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::trace::{self, SinkId, TraceEvent, TracePhase, TraceSink};
use crate::util::{clock, ThreadKey};

/// Completed span, ready for export.
#[derive(Debug, Clone, Serialize)]
pub struct SpanMetrics {
    /// Span id.
    pub span_id: u64,
    /// Parent span, if the task was created inside another task.
    pub parent_span_id: Option<u64>,
    /// Task label.
    pub label: &'static str,
    /// Submission to start, in milliseconds (0 if either is unknown).
    pub queue_duration_ms: u64,
    /// Start to finish, in milliseconds (0 if never started).
    pub execution_duration_ms: u64,
    /// Submission to finish, in milliseconds (0 if submission unseen).
    pub total_duration_ms: u64,
    /// Thread that last handled the span.
    pub thread: ThreadKey,
    /// Immediate queue depth at completion.
    pub queue_depth: usize,
    /// Timer heap depth at completion.
    pub scheduled_depth: usize,
    /// Active workers at completion.
    pub worker_active: usize,
    /// Idle workers at completion.
    pub worker_idle: usize,
    /// Ended by cancellation rather than by running.
    pub cancelled: bool,
    /// The timer thread touched this span.
    pub timer_thread: bool,
}

/// Destination of completed span metrics.
pub trait SpanExporter: Send + Sync {
    /// Receive one completed span.
    fn export(&self, metrics: &SpanMetrics);
}

impl<F> SpanExporter for F
where
    F: Fn(&SpanMetrics) + Send + Sync,
{
    fn export(&self, metrics: &SpanMetrics) {
        self(metrics);
    }
}

#[derive(Debug, Default)]
struct SpanState {
    submitted_at: Option<Instant>,
    started_at: Option<Instant>,
    timer_thread: bool,
}

fn elapsed_ms(from: Instant, to: Instant) -> u64 {
    u64::try_from(clock::diff_ms(from, to)).unwrap_or(0)
}

/// Trace sink that turns lifecycle events into [`SpanMetrics`].
pub struct SpanCollector {
    exporter: Arc<dyn SpanExporter>,
    spans: Mutex<HashMap<u64, SpanState>>,
}

impl SpanCollector {
    /// Collector delivering to `exporter`.
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            exporter,
            spans: Mutex::new(HashMap::new()),
        }
    }

    /// Create a collector and register it as a trace sink.
    pub fn install(exporter: Arc<dyn SpanExporter>) -> (Arc<Self>, SinkId) {
        let collector = Arc::new(Self::new(exporter));
        let id = trace::register_trace_sink(collector.clone());
        (collector, id)
    }

    /// Spans seen but not yet finished.
    pub fn pending_spans(&self) -> usize {
        self.spans.lock().len()
    }
}

impl TraceSink for SpanCollector {
    fn on_event(&self, event: &TraceEvent) {
        let completed = {
            let mut spans = self.spans.lock();
            let state = spans.entry(event.span_id).or_default();
            state.timer_thread |= event.timer_thread;
            match event.phase {
                TracePhase::Submitted => state.submitted_at = Some(event.timestamp),
                TracePhase::Started => state.started_at = Some(event.timestamp),
                _ => {}
            }
            if !matches!(event.phase, TracePhase::Finished | TracePhase::Cancelled) {
                return;
            }
            let state = spans.remove(&event.span_id).unwrap_or_default();
            let queue_duration_ms = match (state.submitted_at, state.started_at) {
                (Some(submitted), Some(started)) => elapsed_ms(submitted, started),
                _ => 0,
            };
            SpanMetrics {
                span_id: event.span_id,
                parent_span_id: event.parent_id,
                label: event.label,
                queue_duration_ms,
                execution_duration_ms: state
                    .started_at
                    .map_or(0, |started| elapsed_ms(started, event.timestamp)),
                total_duration_ms: state
                    .submitted_at
                    .map_or(0, |submitted| elapsed_ms(submitted, event.timestamp)),
                thread: event.thread,
                queue_depth: event.queue_depth,
                scheduled_depth: event.scheduled_depth,
                worker_active: event.worker_active,
                worker_idle: event.worker_idle,
                cancelled: event.phase == TracePhase::Cancelled,
                timer_thread: state.timer_thread,
            }
        };
        self.exporter.export(&completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trace::{generate_span_id, DepthSample, TRACE_LABEL_SCHEDULE_ONCE, TRACE_LABEL_SUBMIT};

    fn event(span: u64, phase: TracePhase, timer_thread: bool, at: Instant) -> TraceEvent {
        let mut event = TraceEvent::new(
            span,
            None,
            TRACE_LABEL_SUBMIT,
            phase,
            timer_thread,
            DepthSample::default(),
        );
        event.timestamp = at;
        event
    }

    fn collector() -> (SpanCollector, Arc<Mutex<Vec<SpanMetrics>>>) {
        let exported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exported);
        let collector = SpanCollector::new(Arc::new(move |metrics: &SpanMetrics| {
            sink.lock().push(metrics.clone());
        }));
        (collector, exported)
    }

    #[test]
    fn test_durations_from_phases() {
        let (collector, exported) = collector();
        let span = generate_span_id();
        let t0 = Instant::now();

        collector.on_event(&event(span, TracePhase::Submitted, false, t0));
        collector.on_event(&event(span, TracePhase::Enqueued, false, t0));
        collector.on_event(&event(span, TracePhase::Started, false, clock::add_ms(t0, 5)));
        assert_eq!(collector.pending_spans(), 1);
        collector.on_event(&event(span, TracePhase::Finished, false, clock::add_ms(t0, 12)));

        let metrics = exported.lock();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].queue_duration_ms, 5);
        assert_eq!(metrics[0].execution_duration_ms, 7);
        assert_eq!(metrics[0].total_duration_ms, 12);
        assert!(!metrics[0].cancelled);
        assert_eq!(collector.pending_spans(), 0);
    }

    #[test]
    fn test_cancelled_timer_span() {
        let (collector, exported) = collector();
        let span = generate_span_id();
        let t0 = Instant::now();

        let mut registered = event(span, TracePhase::TimerRegistered, false, t0);
        registered.label = TRACE_LABEL_SCHEDULE_ONCE;
        collector.on_event(&registered);
        collector.on_event(&event(span, TracePhase::Cancelled, true, clock::add_ms(t0, 3)));

        let metrics = exported.lock();
        assert!(metrics[0].cancelled);
        assert!(metrics[0].timer_thread);
        assert_eq!(metrics[0].execution_duration_ms, 0);
        assert_eq!(metrics[0].total_duration_ms, 0);
    }
}
