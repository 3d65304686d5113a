//! Per-lane work item group
//!
//! TigerStyle: Explicit state machine, single-concurrency per lane.
//!
//! A [`WorkItemGroup`] owns the private FIFO of one scheduling context. The
//! group is published on the [`RunQueue`] at most once at a time: only the
//! `Waiting -> Runnable` transition and the end of a turn that leaves work
//! behind publish it. While `Running`, it is absent from the run queue, so no
//! second worker can enter its turn.
//!
//! The group lock guards bookkeeping only. It is never held while a work
//! item executes or while an item is ignored. While `Running`, the group
//! records the token of the turn that owns it; inline execution is accepted
//! only from that turn.

use crate::run_queue::RunQueue;
use crate::task_scheduler::ActivationTaskScheduler;
use crate::turn::{TurnContext, TurnToken};
use crate::work_item::WorkItem;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};
use turnstile_core::{SchedulerConfig, SchedulerMetrics, SchedulingContext, TimeProvider};

/// Lifecycle state of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    /// Queue empty, not on the run queue
    Waiting,
    /// Published on the run queue, awaiting a worker
    Runnable,
    /// A worker is executing this lane's turn
    Running,
    /// Stopped; never executes again
    Shutdown,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Waiting => write!(f, "waiting"),
            GroupState::Runnable => write!(f, "runnable"),
            GroupState::Running => write!(f, "running"),
            GroupState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Point-in-time statistics for one lane
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub name: String,
    pub state: GroupState,
    pub queue_len: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub quantum_expirations: u64,
    pub average_queue_delay_ms: f64,
}

/// Turn limits resolved from configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct TurnLimits {
    items_cap: Option<u64>,
    quantum_ms: Option<u64>,
    warning_threshold_ms: u64,
    queue_delay_warning_ms: u64,
    pending_soft_limit: usize,
}

impl TurnLimits {
    pub(crate) fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            items_cap: config.turn_items_cap(),
            quantum_ms: config.turn_quantum(),
            warning_threshold_ms: config.turn_warning_threshold_ms,
            queue_delay_warning_ms: config.queue_delay_warning_ms,
            pending_soft_limit: config.pending_work_items_soft_limit,
        }
    }

    fn turn_exhausted(&self, items: u64, elapsed_ms: u64) -> bool {
        self.items_cap.is_some_and(|cap| items >= cap)
            || self.quantum_ms.is_some_and(|quantum| elapsed_ms >= quantum)
    }
}

struct GroupInner {
    state: GroupState,
    /// Turn that owns the lane while `Running`
    active_turn: Option<TurnToken>,
    queue: VecDeque<WorkItem>,
    total_enqueued: u64,
    total_processed: u64,
    quantum_expirations: u64,
    total_queue_delay_ms: u64,
}

/// The single-concurrency micro-queue of one lane
pub struct WorkItemGroup {
    context: SchedulingContext,
    name: String,
    inner: Mutex<GroupInner>,
    run_queue: Arc<RunQueue>,
    limits: TurnLimits,
    time: Arc<dyn TimeProvider>,
    metrics: Arc<dyn SchedulerMetrics>,
    self_ref: Weak<WorkItemGroup>,
}

impl WorkItemGroup {
    pub(crate) fn new(
        context: SchedulingContext,
        run_queue: Arc<RunQueue>,
        limits: TurnLimits,
        time: Arc<dyn TimeProvider>,
        metrics: Arc<dyn SchedulerMetrics>,
    ) -> Arc<Self> {
        let name = context.name();
        Arc::new_cyclic(|self_ref| Self {
            context,
            name,
            inner: Mutex::new(GroupInner {
                state: GroupState::Waiting,
                active_turn: None,
                queue: VecDeque::new(),
                total_enqueued: 0,
                total_processed: 0,
                quantum_expirations: 0,
                total_queue_delay_ms: 0,
            }),
            run_queue,
            limits,
            time,
            metrics,
            self_ref: self_ref.clone(),
        })
    }

    /// Lane identity
    pub fn context(&self) -> &SchedulingContext {
        &self.context
    }

    /// Lane name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this lane is dispatched with system priority
    pub fn is_system_priority(&self) -> bool {
        self.context.is_system_priority()
    }

    /// Current lifecycle state
    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    /// Number of queued, unexecuted items
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the lane has been stopped
    pub fn is_shutdown(&self) -> bool {
        self.state() == GroupState::Shutdown
    }

    /// Whether `turn` is the turn currently running this lane
    pub(crate) fn owns_turn(&self, turn: &TurnContext) -> bool {
        if !turn.is_executing(&self.context) {
            return false;
        }
        let inner = self.inner.lock();
        inner.state == GroupState::Running
            && inner.active_turn.is_some()
            && inner.active_turn == turn.token()
    }

    /// Continuation adapter bound to this lane
    pub fn task_scheduler(self: &Arc<Self>) -> ActivationTaskScheduler {
        ActivationTaskScheduler::new(self.clone())
    }

    /// Append an item to this lane
    ///
    /// Never fails. On a stopped lane the item is ignored immediately.
    pub fn enqueue(&self, mut item: WorkItem) {
        item.set_context(Some(self.context.clone()));
        item.stamp_enqueued(self.time.monotonic_ms());

        let mut inner = self.inner.lock();
        if inner.state == GroupState::Shutdown {
            drop(inner);
            warn!(
                lane = %self.name,
                item = %item.name(),
                kind = %item.kind(),
                "Enqueue on stopped lane, ignoring work item"
            );
            self.metrics.work_items_dropped(&self.name, 1);
            item.ignore("lane stopped");
            return;
        }

        trace!(lane = %self.name, item = %item.name(), "Enqueue");
        inner.queue.push_back(item);
        inner.total_enqueued += 1;
        let queue_len = inner.queue.len();

        if self.limits.pending_soft_limit > 0 && queue_len > self.limits.pending_soft_limit {
            warn!(
                lane = %self.name,
                queue_len,
                soft_limit = self.limits.pending_soft_limit,
                "Lane backlog exceeds pending work item soft limit"
            );
        }

        if inner.state == GroupState::Waiting {
            inner.state = GroupState::Runnable;
            self.publish();
        }
        drop(inner);

        self.metrics.work_item_enqueued(&self.name, queue_len);
    }

    /// Execute one bounded turn of this lane
    ///
    /// Drains queued items in FIFO order until the queue is empty, the item
    /// cap is reached, or the quantum elapses. Afterwards the lane is either
    /// re-published (work remains) or parked as `Waiting`, even if the turn
    /// unwinds.
    pub fn execute_turn(&self, turn: &TurnContext) {
        let lane_turn = turn.enter_lane(&self.context);
        {
            let mut inner = self.inner.lock();
            match inner.state {
                GroupState::Shutdown => {
                    debug!(lane = %self.name, "Turn skipped, lane stopped");
                    return;
                }
                GroupState::Running => {
                    error!(
                        lane = %self.name,
                        worker_id = turn.worker_id(),
                        "Turn requested while lane already running"
                    );
                    debug_assert!(false, "lane turns must not overlap");
                    return;
                }
                GroupState::Waiting | GroupState::Runnable => {}
            }
            inner.state = GroupState::Running;
            inner.active_turn = lane_turn.token();
        }

        let mut guard = TurnGuard {
            group: self,
            limit_reached: false,
            finished: false,
        };
        let turn_start_ms = self.time.monotonic_ms();
        let mut items_executed: u64 = 0;

        loop {
            if lane_turn.is_cancelled() {
                break;
            }

            let item = {
                let mut inner = self.inner.lock();
                if inner.state == GroupState::Shutdown {
                    break;
                }
                inner.queue.pop_front()
            };
            let Some(item) = item else {
                break;
            };

            let item_start_ms = self.time.monotonic_ms();
            let queue_delay_ms = item_start_ms.saturating_sub(item.enqueued_at_ms());
            let item_name = item.name().to_string();
            let kind = item.kind();
            let result = item.execute(&lane_turn);
            let item_elapsed_ms = self.time.elapsed_ms(item_start_ms);

            {
                let mut inner = self.inner.lock();
                inner.total_processed += 1;
                inner.total_queue_delay_ms += queue_delay_ms;
            }
            items_executed += 1;

            if queue_delay_ms > self.limits.queue_delay_warning_ms {
                warn!(
                    lane = %self.name,
                    item = %item_name,
                    queue_delay_ms,
                    "Work item waited in queue past delay threshold"
                );
                self.metrics.queue_delay_exceeded(&self.name, queue_delay_ms);
            }

            if let Err(e) = result {
                error!(
                    lane = %self.name,
                    item = %item_name,
                    kind = %kind,
                    elapsed_ms = item_elapsed_ms,
                    error = %e,
                    "Work item failed"
                );
            }

            if item_elapsed_ms > self.limits.warning_threshold_ms {
                warn!(
                    lane = %self.name,
                    item = %item_name,
                    kind = %kind,
                    elapsed_ms = item_elapsed_ms,
                    "Work item ran past turn warning threshold"
                );
                self.metrics.long_running_item(&self.name, item_elapsed_ms);
            }

            if self
                .limits
                .turn_exhausted(items_executed, self.time.elapsed_ms(turn_start_ms))
            {
                guard.limit_reached = true;
                break;
            }
        }

        let quantum_expired = guard.finish();
        let turn_elapsed_ms = self.time.elapsed_ms(turn_start_ms);
        trace!(
            lane = %self.name,
            worker_id = turn.worker_id(),
            items = items_executed,
            elapsed_ms = turn_elapsed_ms,
            quantum_expired,
            "Turn completed"
        );
        if turn_elapsed_ms > self.limits.warning_threshold_ms {
            warn!(
                lane = %self.name,
                items = items_executed,
                elapsed_ms = turn_elapsed_ms,
                "Turn ran past warning threshold"
            );
        }
        self.metrics
            .turn_completed(&self.name, items_executed, turn_elapsed_ms, quantum_expired);
    }

    /// Leave `Running`: park, or re-publish when work remains
    ///
    /// Returns whether the turn ended on a limit with work still queued.
    fn end_turn(&self, limit_reached: bool) -> bool {
        let mut inner = self.inner.lock();
        inner.active_turn = None;
        match inner.state {
            GroupState::Shutdown => false,
            GroupState::Running => {
                if inner.queue.is_empty() {
                    inner.state = GroupState::Waiting;
                    false
                } else {
                    inner.state = GroupState::Runnable;
                    let expired = limit_reached;
                    if expired {
                        inner.quantum_expirations += 1;
                    }
                    self.publish();
                    expired
                }
            }
            state => {
                debug_assert!(false, "lane left Running during its own turn: {}", state);
                false
            }
        }
    }

    /// Stop this lane, discarding every queued item
    ///
    /// A turn in progress finishes its current item and then exits. Returns
    /// the number of items discarded.
    pub fn stop(&self) -> usize {
        let drained: Vec<WorkItem> = {
            let mut inner = self.inner.lock();
            if inner.state == GroupState::Shutdown {
                debug!(lane = %self.name, "Lane already stopped");
                return 0;
            }
            if inner.state == GroupState::Running || !inner.queue.is_empty() {
                warn!(
                    lane = %self.name,
                    state = %inner.state,
                    queue_len = inner.queue.len(),
                    "Stopping lane with pending work, work was likely not awaited"
                );
            }
            inner.state = GroupState::Shutdown;
            inner.queue.drain(..).collect()
        };

        let count = drained.len();
        if count > 0 {
            self.metrics.work_items_dropped(&self.name, count);
        }
        for item in drained {
            item.ignore("lane stopped");
        }
        debug!(lane = %self.name, dropped = count, "Lane stopped");
        count
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> GroupStats {
        let inner = self.inner.lock();
        let average_queue_delay_ms = if inner.total_processed == 0 {
            0.0
        } else {
            inner.total_queue_delay_ms as f64 / inner.total_processed as f64
        };
        GroupStats {
            name: self.name.clone(),
            state: inner.state,
            queue_len: inner.queue.len(),
            total_enqueued: inner.total_enqueued,
            total_processed: inner.total_processed,
            quantum_expirations: inner.quantum_expirations,
            average_queue_delay_ms,
        }
    }

    /// Human-readable status line
    pub fn dump_status(&self) -> String {
        let stats = self.stats();
        let inner = self.inner.lock();
        let head = inner
            .queue
            .front()
            .map(|item| format!(" next={}({})", item.name(), item.kind()))
            .unwrap_or_default();
        format!(
            "{}: state={} queued={} enqueued={} processed={} quantum_expirations={} avg_queue_delay_ms={:.1}{}",
            stats.name,
            stats.state,
            stats.queue_len,
            stats.total_enqueued,
            stats.total_processed,
            stats.quantum_expirations,
            stats.average_queue_delay_ms,
            head
        )
    }

    // Caller holds the group lock.
    fn publish(&self) {
        if let Some(group) = self.self_ref.upgrade() {
            self.run_queue.publish(WorkItem::group_turn(group));
        }
    }
}

/// Ends the turn on every exit path, including an unwind out of `execute_turn`
struct TurnGuard<'a> {
    group: &'a WorkItemGroup,
    limit_reached: bool,
    finished: bool,
}

impl TurnGuard<'_> {
    fn finish(&mut self) -> bool {
        self.finished = true;
        self.group.end_turn(self.limit_reached)
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            error!(lane = %self.group.name, "Turn unwound, releasing lane");
            self.group.end_turn(self.limit_reached);
        }
    }
}

impl fmt::Debug for WorkItemGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItemGroup")
            .field("context", &self.context)
            .field("state", &self.state())
            .finish()
    }
}
