//! Scheduling property tests
//!
//! TigerStyle: Mutual exclusion, per-lane FIFO, starvation bound and drop
//! semantics exercised against a running worker pool.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use turnstile_core::{Error, Result, SchedulerConfig, SchedulingContext};
use turnstile_scheduler::{RequestHandler, Scheduler, TurnContext};

// =============================================================================
// Helpers
// =============================================================================

fn test_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_threads_count: workers,
        worker_take_timeout_ms: 10,
        thread_injection_enabled: false,
        ..SchedulerConfig::default()
    }
}

fn started(config: SchedulerConfig) -> Scheduler {
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.start().unwrap();
    scheduler
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

/// Tracks how many turns of one lane are executing at once
#[derive(Default)]
struct LaneTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl LaneTracker {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Mutual exclusion
// =============================================================================

#[test]
fn test_at_most_one_turn_per_lane() {
    const LANES: usize = 16;
    const ITEMS_PER_PRODUCER: usize = 100;
    const PRODUCERS: usize = 4;

    let config = SchedulerConfig {
        turn_work_items_max: 3,
        ..test_config(4)
    };
    let scheduler = Arc::new(started(config));

    let lanes: Vec<(SchedulingContext, Arc<LaneTracker>)> = (0..LANES)
        .map(|i| {
            let ctx = SchedulingContext::activation(format!("grain-{}", i)).unwrap();
            scheduler.register_context(&ctx);
            (ctx, Arc::new(LaneTracker::default()))
        })
        .collect();
    let lanes = Arc::new(lanes);
    let done = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let scheduler = scheduler.clone();
            let lanes = lanes.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..ITEMS_PER_PRODUCER {
                    let (ctx, tracker) = &lanes[(p + i) % LANES];
                    let tracker = tracker.clone();
                    let done = done.clone();
                    scheduler
                        .enqueue_closure(Some(ctx), "tracked", move |_turn| {
                            tracker.enter();
                            for _ in 0..50 {
                                thread::yield_now();
                            }
                            tracker.exit();
                            done.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = PRODUCERS * ITEMS_PER_PRODUCER;
    assert!(wait_until(Duration::from_secs(20), || done.load(Ordering::SeqCst) == total));
    for (ctx, tracker) in lanes.iter() {
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1, "lane {} overlapped", ctx);
    }
    scheduler.stop();
}

// =============================================================================
// FIFO per lane
// =============================================================================

#[test]
fn test_fifo_within_lane_across_producers() {
    const PRODUCERS: usize = 4;
    const ITEMS_PER_PRODUCER: usize = 250;

    let config = SchedulerConfig {
        turn_work_items_max: 7,
        ..test_config(4)
    };
    let scheduler = Arc::new(started(config));
    let ctx = SchedulingContext::activation("ordered").unwrap();
    scheduler.register_context(&ctx);

    // Sequence numbers are assigned and enqueued under one lock, which fixes
    // the externally observed total order.
    let sequencer = Arc::new(Mutex::new(0usize));
    let executed = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            let sequencer = sequencer.clone();
            let executed = executed.clone();
            thread::spawn(move || {
                for _ in 0..ITEMS_PER_PRODUCER {
                    let mut next = sequencer.lock();
                    let seq = *next;
                    *next += 1;
                    let executed = executed.clone();
                    scheduler
                        .enqueue_closure(Some(&ctx), "seq", move |_turn| {
                            executed.lock().push(seq);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = PRODUCERS * ITEMS_PER_PRODUCER;
    assert!(wait_until(Duration::from_secs(20), || executed.lock().len() == total));
    let executed = executed.lock().clone();
    assert_eq!(executed, (0..total).collect::<Vec<_>>());
    scheduler.stop();
}

#[test]
fn test_two_lanes_two_producers_scenario() {
    let scheduler = Arc::new(started(test_config(3)));
    let l1 = SchedulingContext::activation("L1").unwrap();
    let l2 = SchedulingContext::activation("L2").unwrap();
    scheduler.register_context(&l1);
    scheduler.register_context(&l2);

    let log1 = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(2));

    type Log = Arc<Mutex<Vec<&'static str>>>;
    let spawn_producer = |ctx: SchedulingContext, log: Log, names: Vec<&'static str>| {
        let scheduler = scheduler.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for name in names {
                let log = log.clone();
                scheduler
                    .enqueue_closure(Some(&ctx), name, move |_turn| log.lock().push(name))
                    .unwrap();
            }
        })
    };

    let a = spawn_producer(l1.clone(), log1.clone(), vec!["A", "B", "C"]);
    let b = spawn_producer(l2.clone(), log2.clone(), vec!["X", "Y"]);
    a.join().unwrap();
    b.join().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        scheduler.stats().total_processed() == 5
    }));
    assert_eq!(*log1.lock(), vec!["A", "B", "C"]);
    assert_eq!(*log2.lock(), vec!["X", "Y"]);
    scheduler.stop();
}

// =============================================================================
// Starvation bound
// =============================================================================

#[test]
fn test_system_lane_not_starved_by_application_backlog() {
    const APP_LANES: usize = 20;
    const ITEMS_PER_LANE: usize = 100;

    let scheduler = started(test_config(2));
    let app_done = Arc::new(AtomicUsize::new(0));

    for i in 0..APP_LANES {
        let ctx = SchedulingContext::activation(format!("busy-{}", i)).unwrap();
        scheduler.register_context(&ctx);
        for _ in 0..ITEMS_PER_LANE {
            let app_done = app_done.clone();
            scheduler
                .enqueue_closure(Some(&ctx), "busy", move |_turn| {
                    thread::sleep(Duration::from_millis(2));
                    app_done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }

    let system = SchedulingContext::system_target("membership").unwrap();
    scheduler.register_context(&system);
    let (tx, rx) = std::sync::mpsc::channel();
    let enqueued_at = Instant::now();
    scheduler
        .enqueue_closure(Some(&system), "heartbeat", move |_turn| {
            tx.send(Instant::now()).unwrap();
        })
        .unwrap();

    let completed_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(completed_at.duration_since(enqueued_at) < Duration::from_secs(1));
    assert!(
        app_done.load(Ordering::SeqCst) < APP_LANES * ITEMS_PER_LANE,
        "system work should complete while application backlog remains"
    );
    scheduler.stop();
}

#[test]
fn test_bare_work_runs_without_lane() {
    let scheduler = started(test_config(1));
    let (tx, rx) = std::sync::mpsc::channel();
    scheduler
        .enqueue_closure(None, "bare", move |turn: &TurnContext| {
            tx.send(turn.lane().is_none()).unwrap();
        })
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    scheduler.stop();
}

// =============================================================================
// Drop semantics
// =============================================================================

struct Echo;

impl RequestHandler for Echo {
    fn handle(&self, _turn: &TurnContext, _operation: &str, payload: Bytes) -> Result<Bytes> {
        Ok(payload)
    }
}

#[test]
fn test_enqueue_on_stopped_lane_is_discarded_synchronously() {
    let scheduler = started(test_config(1));
    let ctx = SchedulingContext::activation("gone").unwrap();
    let group = scheduler.register_context(&ctx);
    group.stop();

    let mut reply = scheduler
        .request(&ctx, Arc::new(Echo), "echo", Bytes::from("ping"))
        .unwrap();
    let err = reply.try_recv().unwrap().unwrap_err();
    assert!(err.is_dropped());

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    scheduler
        .enqueue_closure(Some(&ctx), "late", move |_turn| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    scheduler.stop();
}

#[test]
fn test_stop_discards_queued_requests() {
    let scheduler = Scheduler::new(test_config(1)).unwrap();
    let ctx = SchedulingContext::activation("grain").unwrap();
    scheduler.register_context(&ctx);

    // Not started: requests stay queued until stop discards them.
    let mut replies: Vec<_> = (0..3)
        .map(|_| {
            scheduler
                .request(&ctx, Arc::new(Echo), "echo", Bytes::new())
                .unwrap()
        })
        .collect();
    scheduler.stop();

    for reply in replies.iter_mut() {
        assert!(reply.try_recv().unwrap().unwrap_err().is_dropped());
    }
}

// =============================================================================
// Directory
// =============================================================================

#[test]
fn test_concurrent_registration_returns_same_group() {
    let scheduler = Arc::new(Scheduler::new(test_config(1)).unwrap());
    let ctx = SchedulingContext::activation("shared").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            thread::spawn(move || scheduler.register_context(&ctx))
        })
        .collect();
    let groups: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for group in &groups[1..] {
        assert!(Arc::ptr_eq(&groups[0], group));
    }
    assert_eq!(scheduler.work_item_group_count(), 1);
}

#[test]
fn test_scheduler_from_json_config() {
    let document = serde_json::json!({
        "worker_threads_count": 2,
        "turn_work_items_max": 4,
        "thread_injection_enabled": false
    });
    let config = SchedulerConfig::from_json(&document.to_string()).unwrap();
    let scheduler = started(config);
    assert_eq!(scheduler.config().turn_items_cap(), Some(4));
    assert_eq!(scheduler.active_worker_count(), 3);
    scheduler.stop();
    assert!(!scheduler.is_running());
}

#[test]
fn test_unregistered_context_is_rejected() {
    let scheduler = started(test_config(1));
    let ctx = SchedulingContext::activation("never-registered").unwrap();
    let err = scheduler
        .enqueue_closure(Some(&ctx), "x", |_turn| {})
        .unwrap_err();
    match err {
        Error::InvalidSchedulingContext { context, .. } => {
            assert!(context.contains("never-registered"))
        }
        other => panic!("unexpected error: {:?}", other),
    }
    scheduler.stop();
}

#[test]
fn test_stop_application_work_keeps_system_lanes_running() {
    let scheduler = started(test_config(2));
    let app = SchedulingContext::activation("grain").unwrap();
    let system = SchedulingContext::system_target("directory").unwrap();
    scheduler.register_context(&app);
    scheduler.register_context(&system);

    scheduler.stop_application_work();

    let mut reply = scheduler
        .request(&app, Arc::new(Echo), "echo", Bytes::new())
        .unwrap();
    assert!(reply.try_recv().unwrap().unwrap_err().is_dropped());

    let (tx, rx) = std::sync::mpsc::channel();
    scheduler
        .enqueue_closure(Some(&system), "still-running", move |_turn| tx.send(()).unwrap())
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    scheduler.stop();
}
