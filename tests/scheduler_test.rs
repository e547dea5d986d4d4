//! Integration tests for TaskScheduler
//!
//! These tests verify ordering, delayed and periodic execution, cancellation,
//! the inline fallback when the queue is full, metrics and shutdown.

use lockgraph::config::SchedulerConfig;
use lockgraph::core::{TaskError, TaskScheduler};
use lockgraph::{Guarded, ThreadKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn scheduler(workers: usize) -> TaskScheduler {
    lockgraph::util::init_tracing_with_default("lockgraph=debug");
    TaskScheduler::new(SchedulerConfig::new().with_worker_count(workers)).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// A single worker runs submitted tasks in submission order
#[test]
fn test_single_worker_fifo() {
    let scheduler = scheduler(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let futures: Vec<_> = (0..20)
        .map(|i| {
            let order = Arc::clone(&order);
            scheduler.submit(move || order.lock().push(i))
        })
        .collect();
    for future in futures {
        future.wait().unwrap();
    }

    assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_results_from_many_workers() {
    let scheduler = scheduler(4);
    let futures: Vec<_> = (0..64_u64).map(|i| scheduler.submit(move || i * i)).collect();
    let total: u64 = futures.into_iter().map(|f| f.wait().unwrap()).sum();
    assert_eq!(total, (0..64_u64).map(|i| i * i).sum::<u64>());
}

#[test]
fn test_schedule_after_respects_delay() {
    let scheduler = scheduler(2);
    let start = Instant::now();
    let (future, handle) = scheduler.schedule_after(Duration::from_millis(30), Instant::now);
    assert!(handle.is_valid());
    let ran_at = future.wait_timeout(Duration::from_secs(5)).unwrap();
    assert!(ran_at.duration_since(start) >= Duration::from_millis(30));
}

/// Timed tasks fire in fire-time order, not registration order
#[test]
fn test_timed_tasks_fire_in_time_order() {
    let scheduler = scheduler(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut futures = vec![];

    for (label, delay) in [("late", 60), ("early", 10), ("middle", 35)] {
        let order = Arc::clone(&order);
        let (future, _handle) = scheduler.schedule_after(Duration::from_millis(delay), move || {
            order.lock().push(label);
        });
        futures.push(future);
    }
    for future in futures {
        future.wait_timeout(Duration::from_secs(5)).unwrap();
    }

    assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
}

/// Cancelling only flags the entry; the timer thread drops it when due
#[test]
fn test_cancel_before_fire() {
    let scheduler = scheduler(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    let (future, handle) = scheduler.schedule_after(Duration::from_millis(40), move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(scheduler.scheduled_count(), 1);

    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert!(!handle.cancel());
    assert_eq!(scheduler.scheduled_count(), 1);

    assert_eq!(future.wait_timeout(Duration::from_secs(5)), Err(TaskError::Cancelled));
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.scheduled_count() == 0 && scheduler.stats().cancelled_tasks == 1
    }));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

/// A firing already on the queue runs even if cancelled before a worker takes it
#[test]
fn test_cancel_after_dispatch_still_runs() {
    let scheduler = scheduler(1);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker = scheduler.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    let (future, handle) = scheduler.schedule_after(Duration::from_millis(1), move || {
        ran2.fetch_add(1, Ordering::SeqCst);
        7
    });
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.scheduled_count() == 0 && scheduler.queue_size() == 1
    }));

    assert!(handle.cancel());
    release_tx.send(()).unwrap();
    blocker.wait().unwrap();

    assert_eq!(future.wait_timeout(Duration::from_secs(5)), Ok(7));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats().cancelled_tasks, 0);
}

#[test]
fn test_cancel_after_run_keeps_result() {
    let scheduler = scheduler(1);
    let (future, handle) = scheduler.schedule_after(Duration::ZERO, || 99);
    assert_eq!(future.wait_timeout(Duration::from_secs(5)), Ok(99));
    assert!(handle.cancel());
}

#[test]
fn test_periodic_task_stops_after_cancel() {
    let scheduler = scheduler(2);
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = Arc::clone(&ticks);
    let handle = scheduler.schedule_every(Duration::from_millis(5), move || {
        ticks2.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) >= 3));
    assert!(handle.cancel());

    // One firing may already be on its way to a worker.
    thread::sleep(Duration::from_millis(30));
    let settled = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(ticks.load(Ordering::SeqCst), settled);
    assert!(wait_until(Duration::from_secs(5), || scheduler.scheduled_count() == 0));
}

/// With the queue at capacity, the submitter runs the task itself
#[test]
fn test_full_queue_runs_inline() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig::new()
            .with_worker_count(1)
            .with_max_queue_depth(1),
    )
    .unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let blocker = scheduler.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        "blocker"
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let queued = scheduler.submit(|| thread::current().id());
    assert_eq!(scheduler.queue_size(), 1);

    let caller = thread::current().id();
    let overflow = scheduler.submit(|| thread::current().id());
    assert_eq!(overflow.try_get(), Ok(Some(caller)));
    assert_eq!(scheduler.stats().inline_runs, 1);

    release_tx.send(()).unwrap();
    assert_eq!(blocker.wait().unwrap(), "blocker");
    assert_ne!(queued.wait().unwrap(), caller);
}

/// A full timer heap also falls back to running inline
#[test]
fn test_full_timer_heap_runs_inline() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig::new()
            .with_worker_count(1)
            .with_max_scheduled_tasks(1),
    )
    .unwrap();
    let (_first, first_handle) = scheduler.schedule_after(Duration::from_secs(30), || 1);
    let caller = thread::current().id();
    let (second, _) = scheduler.schedule_after(Duration::from_secs(30), || thread::current().id());

    assert_eq!(second.try_get(), Ok(Some(caller)));
    assert_eq!(scheduler.scheduled_count(), 1);
    first_handle.cancel();
}

#[test]
fn test_worker_metrics() {
    let scheduler = scheduler(3);
    assert_eq!(scheduler.worker_total_count(), 3);
    assert!(wait_until(Duration::from_secs(5), || scheduler.worker_idle_count() == 3));

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let busy = scheduler.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(scheduler.worker_active_count(), 1);
    assert_eq!(scheduler.worker_idle_count(), 2);

    release_tx.send(()).unwrap();
    busy.wait().unwrap();
    assert!(wait_until(Duration::from_secs(5), || scheduler.worker_active_count() == 0));

    let stats = scheduler.stats();
    assert_eq!(stats.worker_total, 3);
    assert_eq!(stats.submitted_tasks, 1);
    assert_eq!(stats.completed_tasks, 1);
}

#[test]
fn test_shutdown_drains_queue() {
    let scheduler = scheduler(1);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..25 {
        let done = Arc::clone(&done);
        scheduler.submit(move || {
            thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 25);
    assert_eq!(scheduler.worker_total_count(), 0);
}

#[test]
fn test_shutdown_abandons_pending_timers() {
    let scheduler = scheduler(1);
    let (future, handle) = scheduler.schedule_after(Duration::from_secs(60), || ());
    drop(scheduler);
    assert_eq!(future.wait(), Err(TaskError::Abandoned));
    assert!(!handle.is_cancelled());
}

/// Tasks contending on tracked mutexes through the scheduler
#[test]
fn test_tasks_share_guarded_state() {
    let scheduler = scheduler(4);
    let total = Arc::new(Guarded::new(0_usize));
    let futures: Vec<_> = (0..100)
        .map(|_| {
            let total = Arc::clone(&total);
            scheduler.submit(move || {
                *total.lock(ThreadKey::current()).unwrap() += 1;
            })
        })
        .collect();
    for future in futures {
        future.wait().unwrap();
    }
    assert_eq!(*total.lock(ThreadKey::current()).unwrap(), 100);
}

#[test]
fn test_thread_names_use_prefix() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig::new()
            .with_worker_count(1)
            .with_thread_name_prefix("unit"),
    )
    .unwrap();
    let name = scheduler
        .submit(|| thread::current().name().map(str::to_owned))
        .wait()
        .unwrap();
    assert_eq!(name.as_deref(), Some("unit-worker-0"));
}

#[cfg(feature = "tokio-runtime")]
#[tokio::test]
async fn test_wait_async() {
    let scheduler = scheduler(2);
    let future = scheduler.submit(|| 21 * 2);
    assert_eq!(future.wait_async().await.unwrap(), 42);
}
