//! Stuck-worker recovery tests
//!
//! TigerStyle: A blocked turn costs one replacement worker, never the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use turnstile_core::{CountingMetrics, SchedulerConfig, SchedulingContext};
use turnstile_scheduler::{HostLoad, Scheduler};

fn injection_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_threads_count: workers,
        worker_take_timeout_ms: 10,
        turn_warning_threshold_ms: 50,
        injection_check_interval_ms: 20,
        ..SchedulerConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Enqueue an item on `ctx` that blocks while the test holds the gate's write lock
fn enqueue_blocker(scheduler: &Scheduler, ctx: &SchedulingContext, gate: &Arc<RwLock<()>>) {
    let gate = gate.clone();
    let (started_tx, started_rx) = mpsc::channel();
    scheduler
        .enqueue_closure(Some(ctx), "blocker", move |_turn| {
            started_tx.send(()).unwrap();
            let _held = gate.read().unwrap();
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_blocked_turn_gets_replacement_then_retires() {
    let metrics = Arc::new(CountingMetrics::new());
    let scheduler = Scheduler::builder()
        .with_config(injection_config(1))
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.active_worker_count(), 2);

    let stuck = SchedulingContext::activation("stuck").unwrap();
    let healthy = SchedulingContext::activation("healthy").unwrap();
    scheduler.register_context(&stuck);
    scheduler.register_context(&healthy);

    let gate = Arc::new(RwLock::new(()));
    let release = gate.write().unwrap();
    enqueue_blocker(&scheduler, &stuck, &gate);

    // One replacement joins while the stuck worker is still alive.
    assert!(wait_until(Duration::from_secs(5), || scheduler.active_worker_count() == 3));
    assert!(!scheduler.check_health());
    assert_eq!(scheduler.stats().retiring_workers, 1);

    // Other lanes keep making progress during the stall.
    let progressed = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let progressed = progressed.clone();
        scheduler
            .enqueue_closure(Some(&healthy), "work", move |_turn| {
                progressed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || progressed.load(Ordering::SeqCst) == 10));

    drop(release);
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.active_worker_count() == 2 && metrics.snapshot().workers_retired == 1
    }));
    assert!(scheduler.check_health());
    assert_eq!(metrics.snapshot().workers_injected, 1);
    scheduler.stop();
}

#[test]
fn test_injection_budget_caps_replacements() {
    let config = SchedulerConfig {
        injected_workers_max: 1,
        ..injection_config(2)
    };
    let scheduler = Scheduler::new(config).unwrap();
    scheduler.start().unwrap();

    let a = SchedulingContext::activation("stuck-a").unwrap();
    let b = SchedulingContext::activation("stuck-b").unwrap();
    scheduler.register_context(&a);
    scheduler.register_context(&b);

    let gate = Arc::new(RwLock::new(()));
    let release = gate.write().unwrap();
    enqueue_blocker(&scheduler, &a, &gate);
    enqueue_blocker(&scheduler, &b, &gate);

    assert!(wait_until(Duration::from_secs(5), || scheduler.active_worker_count() == 4));
    // Several more monitor passes must not exceed the budget.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(scheduler.active_worker_count(), 4);
    assert_eq!(scheduler.stats().retiring_workers, 1);

    drop(release);
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.active_worker_count() == 3 && scheduler.stats().retiring_workers == 0
    }));
    scheduler.stop();
}

#[derive(Debug)]
struct SaturatedHost;

impl HostLoad for SaturatedHost {
    fn cpu_usage_percent(&self) -> Option<f32> {
        Some(97.5)
    }
}

#[test]
fn test_saturated_host_suppresses_injection() {
    let scheduler = Scheduler::builder()
        .with_config(injection_config(1))
        .with_host_load(Arc::new(SaturatedHost))
        .build()
        .unwrap();
    scheduler.start().unwrap();

    let ctx = SchedulingContext::activation("stuck").unwrap();
    scheduler.register_context(&ctx);
    let gate = Arc::new(RwLock::new(()));
    let release = gate.write().unwrap();
    enqueue_blocker(&scheduler, &ctx, &gate);

    assert!(wait_until(Duration::from_secs(5), || !scheduler.check_health()));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(scheduler.active_worker_count(), 2);

    drop(release);
    assert!(wait_until(Duration::from_secs(5), || scheduler.check_health()));
    scheduler.stop();
}

#[test]
fn test_dump_status_shows_stuck_worker() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_injection_enabled: false,
        ..injection_config(1)
    })
    .unwrap();
    scheduler.start().unwrap();

    let ctx = SchedulingContext::activation("slow").unwrap();
    scheduler.register_context(&ctx);
    let gate = Arc::new(RwLock::new(()));
    let release = gate.write().unwrap();
    enqueue_blocker(&scheduler, &ctx, &gate);

    let status = scheduler.dump_status();
    assert!(status.contains("running [Activation slow]"), "{}", status);
    assert!(status.contains("state=running"), "{}", status);

    drop(release);
    scheduler.stop();
}
