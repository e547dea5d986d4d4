//! Worker and timer threads behind [`TaskScheduler`].
//!
//! # Design
//!
//! - **No polling**: workers block in `BlockingQueue::wait_pop`, the timer
//!   thread waits on a tracked condvar until the earliest fire time
//! - **Never lose a task**: a refused handoff runs the body inline, once
//! - **Clean shutdown**: the queue drains before workers exit; pending timed
//!   entries are dropped and their futures report `Abandoned`

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::condvar::TrackedCondvar;
use crate::config::SchedulerConfig;
use crate::core::error::{PushError, SchedulerError};
use crate::core::trace::{
    self, DepthSample, SpanScope, TraceEvent, TracePhase, TRACE_LABEL_SCHEDULE_EVERY,
    TRACE_LABEL_SCHEDULE_ONCE, TRACE_LABEL_SUBMIT,
};
use crate::infra::queue::{BlockingQueue, TimerHeap};
use crate::mutex::Guarded;
use crate::util::{clock, ThreadKey};

use super::task::{CancelState, Job, ScheduledTaskHandle, TaskBody, TaskFuture, TimerEntry};
use super::{SchedulerCounters, SchedulerStats};

/// Shortest period accepted by `schedule_every`.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Where a job body is being run from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSite {
    Worker,
    Timer,
    Caller,
}

/// State shared by the scheduler, its threads and task handles.
struct Shared {
    queue: BlockingQueue<Job>,
    timers: Guarded<TimerHeap<TimerEntry>>,
    timer_signal: TrackedCondvar,
    running: AtomicBool,
    counters: SchedulerCounters,
    next_key: AtomicU64,
}

impl Shared {
    fn depths(&self) -> DepthSample {
        DepthSample {
            queue_depth: self.queue.len(),
            scheduled_depth: self.counters.scheduled_count.load(Ordering::Acquire),
            worker_active: self.counters.worker_active.load(Ordering::Acquire),
            worker_idle: self.counters.worker_idle.load(Ordering::Acquire),
        }
    }

    fn trace(
        &self,
        span_id: u64,
        parent_id: Option<u64>,
        label: &'static str,
        phase: TracePhase,
        timer_thread: bool,
    ) {
        trace::emit(&TraceEvent::new(
            span_id,
            parent_id,
            label,
            phase,
            timer_thread,
            self.depths(),
        ));
    }

    fn trace_job(&self, job: &Job, phase: TracePhase, timer_thread: bool) {
        self.trace(job.span_id, job.parent_id, job.label, phase, timer_thread);
    }

    /// Hand `job` to the workers, or run it here if the queue refuses.
    fn enqueue_or_run(&self, job: Job, site: RunSite) {
        let timer_thread = site == RunSite::Timer;
        self.trace_job(&job, TracePhase::Enqueued, timer_thread);
        match self.queue.push(job) {
            Ok(()) => {}
            Err(PushError::Full(job)) => {
                debug!(span_id = job.span_id, "Queue full, running task inline");
                self.run_inline(job, site);
            }
            Err(PushError::Shutdown(job)) => {
                if site == RunSite::Timer {
                    debug!(span_id = job.span_id, "Queue shut down, dropping timed task");
                    return;
                }
                debug!(span_id = job.span_id, "Scheduler stopped, running task inline");
                self.run_inline(job, site);
            }
        }
    }

    fn run_inline(&self, job: Job, site: RunSite) {
        self.counters.inline_runs.fetch_add(1, Ordering::Relaxed);
        self.run_job(job, site);
    }

    fn run_job(&self, job: Job, site: RunSite) {
        let timer_thread = site == RunSite::Timer;
        let Job {
            span_id,
            parent_id,
            label,
            body,
        } = job;
        let _scope = SpanScope::enter(span_id);
        self.trace(span_id, parent_id, label, TracePhase::Started, timer_thread);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.run()));
        self.trace(span_id, parent_id, label, TracePhase::Finished, timer_thread);

        if outcome.is_ok() {
            self.counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.panicked_tasks.fetch_add(1, Ordering::Relaxed);
            error!(span_id, label, ?site, "Task panicked");
        }
    }

    /// Insert a timed entry, or run its body once here if the heap refuses.
    fn schedule_entry(&self, fire_at: Instant, entry: TimerEntry) {
        self.trace(
            entry.span_id,
            entry.parent_id,
            entry.label,
            TracePhase::TimerRegistered,
            false,
        );
        let rejected = if self.running.load(Ordering::Acquire) {
            self.push_timer(fire_at, entry)
        } else {
            Some(entry)
        };
        if let Some(entry) = rejected {
            let (job, _) = entry.fire();
            debug!(span_id = job.span_id, "Timer heap refused task, running inline");
            self.run_inline(job, RunSite::Caller);
        }
    }

    fn push_timer(&self, fire_at: Instant, entry: TimerEntry) -> Option<TimerEntry> {
        let mut heap = match self.timers.lock(ThreadKey::current()) {
            Ok(heap) => heap,
            Err(err) => {
                warn!(error = %err, "Could not lock timer heap");
                return Some(entry);
            }
        };
        let key = entry.cancel.key;
        match heap.push(fire_at, key, entry) {
            Ok(()) => {
                self.counters
                    .scheduled_count
                    .store(heap.len(), Ordering::Release);
                self.timer_signal.notify_one();
                None
            }
            Err(err) => {
                warn!(capacity = heap.capacity(), "Timer heap full");
                Some(err.into_inner())
            }
        }
    }

    /// Wait for due entries. `None` once the scheduler stops.
    fn next_due(&self, me: ThreadKey) -> Option<Vec<(Instant, TimerEntry)>> {
        let mut heap = match self.timers.lock(me) {
            Ok(heap) => heap,
            Err(err) => {
                error!(error = %err, "Timer thread could not lock timer heap");
                return None;
            }
        };
        loop {
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            let waited = match heap.next_fire_time() {
                None => self.timer_signal.wait(&mut heap).map(|()| true),
                Some(fire_at) if fire_at > clock::now() => {
                    self.timer_signal.wait_until(&mut heap, fire_at).map(|_| true)
                }
                Some(_) => Ok(false),
            };
            match waited {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    error!(error = %err, "Timer wait failed");
                    return None;
                }
            }
        }

        let now = clock::now();
        let mut due = Vec::new();
        while let Some((fire_at, _, entry)) = heap.pop_due(now) {
            due.push((fire_at, entry));
        }
        self.counters
            .scheduled_count
            .store(heap.len(), Ordering::Release);
        Some(due)
    }

    /// Fire one due entry. Cancelled entries are dropped here and nowhere
    /// else; once a job is handed to the queue it runs.
    fn dispatch_due(&self, fire_at: Instant, entry: TimerEntry) {
        if entry.cancel.is_cancelled() {
            self.counters.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
            self.trace(entry.span_id, entry.parent_id, entry.label, TracePhase::Cancelled, true);
            return;
        }
        self.trace(
            entry.span_id,
            entry.parent_id,
            entry.label,
            TracePhase::TimerTriggered,
            true,
        );
        let interval = entry.interval;
        let (job, rearm) = entry.fire();
        self.enqueue_or_run(job, RunSite::Timer);

        let (Some(entry), Some(interval)) = (rearm, interval) else {
            return;
        };
        if entry.cancel.is_cancelled() || !self.running.load(Ordering::Acquire) {
            return;
        }
        let now = clock::now();
        let mut next = fire_at.checked_add(interval).unwrap_or(now);
        if next <= now {
            // Fell behind: skip missed ticks instead of bursting.
            next = now.checked_add(interval).unwrap_or(now);
        }
        if let Some(entry) = self.push_timer(next, entry) {
            warn!(span_id = entry.span_id, "Periodic task dropped: timer heap full");
        }
    }
}

/// Fixed pool of worker threads plus one timer thread.
///
/// Every call that hands over work returns immediately; if the work cannot
/// be handed over (queue at capacity, heap at capacity, scheduler shut down)
/// the body runs synchronously on the calling thread instead.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Start the worker and timer threads.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if validation fails
    /// - `SchedulerError::Spawn` if a thread could not be started; threads
    ///   already started are shut down first
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let worker_count = config.resolved_worker_count();

        let shared = Arc::new(Shared {
            queue: BlockingQueue::with_capacity_limit(config.max_queue_depth),
            timers: Guarded::new(TimerHeap::new(config.max_scheduled_tasks)),
            timer_signal: TrackedCondvar::new(),
            running: AtomicBool::new(true),
            counters: SchedulerCounters::default(),
            next_key: AtomicU64::new(1),
        });
        let scheduler = Self {
            shared,
            config,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            timer: Mutex::new(None),
        };

        for worker_id in 0..worker_count {
            let handle = scheduler.spawn_worker(worker_id)?;
            scheduler.workers.lock().push(handle);
        }
        let timer = scheduler.spawn_timer()?;
        *scheduler.timer.lock() = Some(timer);

        info!(
            worker_count,
            max_queue_depth = ?scheduler.config.max_queue_depth,
            max_scheduled_tasks = scheduler.config.max_scheduled_tasks,
            "TaskScheduler started"
        );
        Ok(scheduler)
    }

    fn spawn_worker(&self, worker_id: usize) -> Result<JoinHandle<()>, SchedulerError> {
        let shared = Arc::clone(&self.shared);
        shared.counters.worker_total.fetch_add(1, Ordering::AcqRel);
        shared.counters.worker_idle.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{worker_id}", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || worker_loop(worker_id, &shared));
        spawned.map_err(|source| {
            self.shared.counters.worker_total.fetch_sub(1, Ordering::AcqRel);
            self.shared.counters.worker_idle.fetch_sub(1, Ordering::AcqRel);
            SchedulerError::Spawn {
                role: "worker",
                source,
            }
        })
    }

    fn spawn_timer(&self) -> Result<JoinHandle<()>, SchedulerError> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("{}-timer", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || timer_loop(&shared))
            .map_err(|source| SchedulerError::Spawn {
                role: "timer",
                source,
            })
    }

    /// Run `f` on a worker.
    pub fn submit<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let span_id = trace::generate_span_id();
        let parent_id = trace::current_span();
        let job = Job {
            span_id,
            parent_id,
            label: TRACE_LABEL_SUBMIT,
            body: TaskBody::Once(Box::new(move || {
                // Receiver may be gone; the work still counts as done.
                let _ = tx.send(f());
            })),
        };
        self.shared.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.shared.trace_job(&job, TracePhase::Submitted, false);
        self.shared.enqueue_or_run(job, RunSite::Caller);
        TaskFuture::new(rx, None, span_id)
    }

    /// Run `f` once, no earlier than `delay` from now.
    pub fn schedule_after<F, R>(&self, delay: Duration, f: F) -> (TaskFuture<R>, ScheduledTaskHandle)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let body = TaskBody::Once(Box::new(move || {
            let _ = tx.send(f());
        }));
        let (state, span_id) = self.schedule(delay, None, TRACE_LABEL_SCHEDULE_ONCE, body);
        let handle = ScheduledTaskHandle::new(Arc::clone(&state), span_id);
        (TaskFuture::new(rx, Some(state), span_id), handle)
    }

    /// Run `f` every `interval`, first after one interval, until cancelled or
    /// shut down. Intervals below one millisecond are raised to one.
    pub fn schedule_every<F>(&self, interval: Duration, f: F) -> ScheduledTaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let body = TaskBody::Periodic(Arc::new(f));
        let (state, span_id) =
            self.schedule(interval, Some(interval), TRACE_LABEL_SCHEDULE_EVERY, body);
        ScheduledTaskHandle::new(state, span_id)
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        label: &'static str,
        body: TaskBody,
    ) -> (Arc<CancelState>, u64) {
        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(CancelState::new(key));
        let span_id = trace::generate_span_id();
        let entry = TimerEntry {
            span_id,
            parent_id: trace::current_span(),
            label,
            interval,
            body,
            cancel: Arc::clone(&state),
        };
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let fire_at = clock::add_ms(clock::now(), millis);
        self.shared.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.shared.schedule_entry(fire_at, entry);
        (state, span_id)
    }

    /// Tasks waiting in the immediate queue.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.len()
    }

    /// Pending timed entries.
    pub fn scheduled_count(&self) -> usize {
        self.shared.counters.scheduled_count.load(Ordering::Acquire)
    }

    /// Workers currently running a task.
    pub fn worker_active_count(&self) -> usize {
        self.shared.counters.worker_active.load(Ordering::Acquire)
    }

    /// Workers currently waiting for a task.
    pub fn worker_idle_count(&self) -> usize {
        self.shared.counters.worker_idle.load(Ordering::Acquire)
    }

    /// Worker threads alive.
    pub fn worker_total_count(&self) -> usize {
        self.shared.counters.worker_total.load(Ordering::Acquire)
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot(self.shared.queue.len())
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called yet.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Configuration the scheduler was built with.
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Stop accepting timed work, let workers drain the queue, and join all
    /// threads. Idempotent.
    ///
    /// Pending timed entries are dropped. Calling this from a task body
    /// skips joining the calling worker.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down task scheduler");
        self.shared.queue.shutdown();

        let me = ThreadKey::current();
        match self.shared.timers.lock(me) {
            Ok(_heap) => self.shared.timer_signal.notify_all(),
            Err(err) => {
                warn!(error = %err, "Could not lock timer heap during shutdown");
                self.shared.timer_signal.notify_all();
            }
        }

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let worker_count = workers.len();
        for (worker_id, worker) in workers.into_iter().enumerate() {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(worker_id, "Worker panicked");
            }
        }
        if let Some(timer) = self.timer.lock().take() {
            if timer.thread().id() != current && timer.join().is_err() {
                warn!("Timer thread panicked");
            }
        }

        let dropped = match self.shared.timers.lock(me) {
            Ok(mut heap) => {
                let dropped = heap.drain_sorted().len();
                self.shared.counters.scheduled_count.store(0, Ordering::Release);
                dropped
            }
            Err(_) => 0,
        };
        info!(worker_count, dropped_timed_tasks = dropped, "Task scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    debug!(worker_id, "Worker thread started");
    while let Ok(job) = shared.queue.wait_pop(&shared.running) {
        shared.counters.worker_busy(true);
        shared.trace_job(&job, TracePhase::Dequeued, false);
        shared.run_job(job, RunSite::Worker);
        shared.counters.worker_busy(false);
    }
    shared.counters.worker_idle.fetch_sub(1, Ordering::AcqRel);
    shared.counters.worker_total.fetch_sub(1, Ordering::AcqRel);
    debug!(worker_id, "Worker thread exiting");
}

fn timer_loop(shared: &Shared) {
    let me = ThreadKey::current();
    debug!(thread = %me, "Timer thread started");
    while let Some(due) = shared.next_due(me) {
        for (fire_at, entry) in due {
            shared.dispatch_due(fire_at, entry);
        }
    }
    debug!("Timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(workers: usize) -> TaskScheduler {
        TaskScheduler::new(SchedulerConfig::new().with_worker_count(workers)).unwrap()
    }

    #[test]
    fn test_submit_returns_value() {
        let scheduler = scheduler(2);
        let future = scheduler.submit(|| "hello".to_string());
        assert_eq!(future.wait().unwrap(), "hello");
        assert_eq!(scheduler.worker_total_count(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TaskScheduler::new(SchedulerConfig::new().with_max_queue_depth(0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn test_worker_survives_panic() {
        let scheduler = scheduler(1);
        let bad = scheduler.submit(|| -> u8 { panic!("boom") });
        assert_eq!(bad.wait(), Err(crate::core::error::TaskError::Abandoned));
        assert_eq!(scheduler.submit(|| 5).wait().unwrap(), 5);
        assert_eq!(scheduler.stats().panicked_tasks, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_runs_inline_after() {
        let scheduler = scheduler(1);
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.worker_total_count(), 0);

        let caller = thread::current().id();
        let ran_on = scheduler.submit(move || thread::current().id()).wait().unwrap();
        assert_eq!(ran_on, caller);
        assert_eq!(scheduler.stats().inline_runs, 1);
    }

    #[test]
    fn test_periodic_rearms() {
        let scheduler = scheduler(1);
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks2 = Arc::clone(&ticks);
        let handle = scheduler.schedule_every(Duration::from_millis(5), move || {
            ticks2.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert!(handle.cancel());
    }
}
