//! Worker pool
//!
//! TigerStyle: Bounded waits, cooperative retirement, no forced kills.
//!
//! The pool runs `worker_threads_count` application workers that take from
//! both run queue lanes plus one dedicated system worker that only takes
//! system-priority work. A monitor thread periodically looks for workers stuck
//! in a single turn; each stuck worker gets a replacement immediately and is
//! marked to retire once its current turn finishes.

use crate::run_queue::RunQueue;
use crate::turn::{CancellationToken, TurnContext, WorkerId};
use crate::work_item::{panic_message, WorkItem, WorkItemKind};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use turnstile_core::constants::{WORKER_STOP_WAIT_MS_MAX, WORKER_SYSTEM_THREADS_COUNT};
use turnstile_core::error::{Error, Result};
use turnstile_core::{SchedulerConfig, SchedulerMetrics, TimeProvider};

// ============================================================================
// Host load
// ============================================================================

/// Source of host CPU usage, consulted before injecting a worker
pub trait HostLoad: Send + Sync + fmt::Debug {
    /// Current CPU usage in percent, `None` when unknown
    fn cpu_usage_percent(&self) -> Option<f32>;
}

/// Host load provider that never reports a value
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostLoad;

impl HostLoad for NoHostLoad {
    fn cpu_usage_percent(&self) -> Option<f32> {
        None
    }
}

// ============================================================================
// Worker slots
// ============================================================================

/// Which run queue lanes a worker takes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Takes from both lanes, system first
    Application,
    /// Takes from the system lane only
    System,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Application => write!(f, "application"),
            WorkerKind::System => write!(f, "system"),
        }
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub kind: WorkerKind,
    /// Name of the unit being executed, if any
    pub current_item: Option<String>,
    /// How long the current unit has been running
    pub turn_elapsed_ms: Option<u64>,
    pub retiring: bool,
}

#[derive(Debug)]
struct ActiveTurn {
    started_ms: u64,
    name: String,
}

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    kind: WorkerKind,
    current: Mutex<Option<ActiveTurn>>,
    retiring: AtomicBool,
}

impl WorkerSlot {
    fn status(&self, time: &dyn TimeProvider) -> WorkerStatus {
        let current = self.current.lock();
        WorkerStatus {
            id: self.id,
            kind: self.kind,
            current_item: current.as_ref().map(|turn| turn.name.clone()),
            turn_elapsed_ms: current.as_ref().map(|turn| time.elapsed_ms(turn.started_ms)),
            retiring: self.retiring.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Shared pool state
// ============================================================================

struct PoolShared {
    config: SchedulerConfig,
    run_queue: Arc<RunQueue>,
    cancel: CancellationToken,
    slots: Mutex<HashMap<WorkerId, Arc<WorkerSlot>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    /// Workers marked for retirement that have not exited yet
    retiring_live: AtomicUsize,
    time: Arc<dyn TimeProvider>,
    metrics: Arc<dyn SchedulerMetrics>,
    host_load: Arc<dyn HostLoad>,
}

impl PoolShared {
    fn spawn_worker(self: &Arc<Self>, kind: WorkerKind) -> Result<WorkerId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(WorkerSlot {
            id,
            kind,
            current: Mutex::new(None),
            retiring: AtomicBool::new(false),
        });
        self.slots.lock().insert(id, slot.clone());

        let shared = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("turnstile-{}-{}", kind, id))
            .spawn(move || worker_loop(shared, slot));

        match spawned {
            Ok(handle) => {
                self.handles.lock().push(handle);
                debug!(worker_id = id, kind = %kind, "Worker started");
                Ok(id)
            }
            Err(e) => {
                self.slots.lock().remove(&id);
                Err(Error::WorkerSpawnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn take(&self, kind: WorkerKind, timeout: Duration) -> Option<WorkItem> {
        match kind {
            WorkerKind::System => self.run_queue.take_system(timeout),
            WorkerKind::Application => self.run_queue.take_any(timeout),
        }
    }

    fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .slots
            .lock()
            .values()
            .map(|slot| slot.status(self.time.as_ref()))
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    /// Inject replacements for workers stuck past the warning threshold
    fn check_stuck_workers(self: &Arc<Self>) {
        let threshold_ms = self.config.turn_warning_threshold_ms;
        let stuck: Vec<Arc<WorkerSlot>> = self
            .slots
            .lock()
            .values()
            .filter(|slot| !slot.retiring.load(Ordering::SeqCst))
            .filter(|slot| {
                slot.current
                    .lock()
                    .as_ref()
                    .is_some_and(|turn| self.time.elapsed_ms(turn.started_ms) > threshold_ms)
            })
            .cloned()
            .collect();

        for slot in stuck {
            let status = slot.status(self.time.as_ref());
            warn!(
                worker_id = slot.id,
                kind = %slot.kind,
                item = status.current_item.as_deref().unwrap_or("<idle>"),
                elapsed_ms = status.turn_elapsed_ms.unwrap_or(0),
                "Worker stuck in a single turn"
            );

            if !self.config.thread_injection_enabled || self.cancel.is_cancelled() {
                continue;
            }

            let live = self.retiring_live.load(Ordering::SeqCst);
            if live >= self.config.injected_workers_max {
                warn!(
                    retiring_live = live,
                    injected_workers_max = self.config.injected_workers_max,
                    "Injection budget exhausted, not replacing stuck worker"
                );
                return;
            }

            if let Some(cpu) = self.host_load.cpu_usage_percent() {
                if cpu >= self.config.injection_cpu_usage_percent_max {
                    warn!(
                        cpu_usage_percent = cpu,
                        cpu_usage_percent_max = self.config.injection_cpu_usage_percent_max,
                        "Host CPU too busy, not replacing stuck worker"
                    );
                    return;
                }
            }

            self.retiring_live.fetch_add(1, Ordering::SeqCst);
            slot.retiring.store(true, Ordering::SeqCst);
            match self.spawn_worker(slot.kind) {
                Ok(replacement_id) => {
                    info!(
                        worker_id = slot.id,
                        replacement_id,
                        kind = %slot.kind,
                        "Injected replacement for stuck worker"
                    );
                    self.metrics.worker_injected();
                }
                Err(e) => {
                    slot.retiring.store(false, Ordering::SeqCst);
                    self.retiring_live.fetch_sub(1, Ordering::SeqCst);
                    error!(worker_id = slot.id, error = %e, "Failed to inject replacement worker");
                }
            }
        }
    }
}

enum WorkerExit {
    Cancelled,
    Retired,
    Crashed,
}

fn worker_loop(shared: Arc<PoolShared>, slot: Arc<WorkerSlot>) {
    let turn = TurnContext::new(slot.id, shared.cancel.clone());
    let timeout = Duration::from_millis(shared.config.worker_take_timeout_ms);

    let exit = loop {
        if shared.cancel.is_cancelled() {
            break WorkerExit::Cancelled;
        }
        if slot.retiring.load(Ordering::SeqCst) {
            break WorkerExit::Retired;
        }

        let Some(item) = shared.take(slot.kind, timeout) else {
            continue;
        };

        let started_ms = shared.time.monotonic_ms();
        if item.kind() != WorkItemKind::GroupTurn {
            let queue_delay_ms = started_ms.saturating_sub(item.enqueued_at_ms());
            if queue_delay_ms > shared.config.queue_delay_warning_ms {
                warn!(
                    worker_id = slot.id,
                    item = %item.name(),
                    queue_delay_ms,
                    "Work item waited in run queue past delay threshold"
                );
                shared.metrics.queue_delay_exceeded(item.name(), queue_delay_ms);
            }
        }

        let name = item.name().to_string();
        *slot.current.lock() = Some(ActiveTurn {
            started_ms,
            name: name.clone(),
        });
        let outcome = catch_unwind(AssertUnwindSafe(|| item.execute(&turn)));
        *slot.current.lock() = None;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    worker_id = slot.id,
                    item = %name,
                    elapsed_ms = shared.time.elapsed_ms(started_ms),
                    error = %e,
                    "Work item failed"
                );
            }
            Err(panic) => {
                error!(
                    worker_id = slot.id,
                    item = %name,
                    panic = %panic_message(panic.as_ref()),
                    "Unexpected panic escaped turn execution, worker exiting"
                );
                break WorkerExit::Crashed;
            }
        }
    };

    shared.slots.lock().remove(&slot.id);
    if slot.retiring.load(Ordering::SeqCst) {
        shared.retiring_live.fetch_sub(1, Ordering::SeqCst);
    }

    match exit {
        WorkerExit::Cancelled => debug!(worker_id = slot.id, "Worker stopped"),
        WorkerExit::Retired => {
            info!(worker_id = slot.id, "Replaced worker retired");
            shared.metrics.worker_retired();
        }
        WorkerExit::Crashed => {
            shared.metrics.worker_crashed();
            if shared.cancel.is_cancelled() || slot.retiring.load(Ordering::SeqCst) {
                return;
            }
            match shared.spawn_worker(slot.kind) {
                Ok(replacement_id) => {
                    warn!(worker_id = slot.id, replacement_id, "Replaced crashed worker")
                }
                Err(e) => error!(worker_id = slot.id, error = %e, "Failed to replace crashed worker"),
            }
        }
    }
}

fn monitor_loop(shared: Arc<PoolShared>, shutdown_rx: crossbeam_channel::Receiver<()>) {
    let interval = Duration::from_millis(shared.config.injection_check_interval_ms);
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => shared.check_stuck_workers(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Worker monitor stopped");
}

// ============================================================================
// WorkerPool
// ============================================================================

/// The set of worker threads executing the run queue
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    monitor: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    started: AtomicBool,
}

impl WorkerPool {
    /// Create a pool; no threads run until [`WorkerPool::start`]
    pub fn new(
        config: SchedulerConfig,
        run_queue: Arc<RunQueue>,
        time: Arc<dyn TimeProvider>,
        metrics: Arc<dyn SchedulerMetrics>,
        host_load: Arc<dyn HostLoad>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                run_queue,
                cancel: CancellationToken::new(),
                slots: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(0),
                retiring_live: AtomicUsize::new(0),
                time,
                metrics,
                host_load,
            }),
            monitor: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the application workers, the system worker and the monitor
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::SchedulerAlreadyStarted);
        }

        let config = &self.shared.config;
        for _ in 0..config.worker_threads_count {
            self.shared.spawn_worker(WorkerKind::Application)?;
        }
        for _ in 0..WORKER_SYSTEM_THREADS_COUNT {
            self.shared.spawn_worker(WorkerKind::System)?;
        }

        if config.thread_injection_enabled {
            let (shutdown_tx, shutdown_rx) = bounded(1);
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name("turnstile-monitor".to_string())
                .spawn(move || monitor_loop(shared, shutdown_rx))
                .map_err(|e| Error::WorkerSpawnFailed {
                    reason: e.to_string(),
                })?;
            *self.monitor.lock() = Some((shutdown_tx, handle));
        }

        info!(
            application_workers = config.worker_threads_count,
            system_workers = WORKER_SYSTEM_THREADS_COUNT,
            thread_injection = config.thread_injection_enabled,
            "Worker pool started"
        );
        Ok(())
    }

    /// Cancel every worker and wait for them to exit
    ///
    /// Idle workers exit within one dequeue timeout. Workers inside a turn
    /// finish it first; any still running after a bounded wait are detached.
    pub fn stop(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();

        if let Some((shutdown_tx, handle)) = self.monitor.lock().take() {
            let _ = shutdown_tx.send(());
            if handle.join().is_err() {
                error!("Worker monitor panicked");
            }
        }

        let deadline = Instant::now() + Duration::from_millis(WORKER_STOP_WAIT_MS_MAX);
        while self.active_worker_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let handles: Vec<JoinHandle<()>> = self.shared.handles.lock().drain(..).collect();
        let mut detached = 0;
        for handle in handles {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Worker thread panicked outside turn execution");
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(detached, "Workers still inside a turn at stop, detaching");
        }
        info!("Worker pool stopped");
    }

    /// Whether the pool has been started and not stopped
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.cancel.is_cancelled()
    }

    /// Pool-wide cancellation token
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Number of live worker threads, including ones marked to retire
    pub fn active_worker_count(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Number of stuck workers waiting to retire
    pub fn retiring_worker_count(&self) -> usize {
        self.shared.retiring_live.load(Ordering::SeqCst)
    }

    /// Snapshot of every live worker, ordered by id
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.shared.statuses()
    }

    /// Run one stuck-worker check now
    pub fn check_stuck_workers(&self) {
        self.shared.check_stuck_workers();
    }

    /// Health signal for an external liveness probe
    ///
    /// Unhealthy while any worker has been inside one turn longer than the
    /// turn warning threshold.
    pub fn check_health(&self) -> bool {
        let threshold_ms = self.shared.config.turn_warning_threshold_ms;
        let mut healthy = true;
        for status in self.worker_statuses() {
            if let Some(elapsed_ms) = status.turn_elapsed_ms {
                if elapsed_ms > threshold_ms {
                    warn!(
                        worker_id = status.id,
                        item = status.current_item.as_deref().unwrap_or("<idle>"),
                        elapsed_ms,
                        "Health check: worker turn exceeds warning threshold"
                    );
                    healthy = false;
                }
            }
        }
        healthy
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.is_running())
            .field("workers", &self.active_worker_count())
            .field("retiring", &self.retiring_worker_count())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
