//! Scheduler façade
//!
//! TigerStyle: Single entry point, explicit configuration, clean shutdown.
//!
//! [`Scheduler`] owns the run queue, the worker pool, and the directory that
//! maps each [`SchedulingContext`] to its [`WorkItemGroup`]. Producers enqueue
//! against a context; bare work with no context goes straight to the run
//! queue.

use crate::group::{GroupStats, TurnLimits, WorkItemGroup};
use crate::run_queue::RunQueue;
use crate::task_scheduler::{ActivationTaskScheduler, LaneJoinHandle};
use crate::turn::TurnContext;
use crate::work_item::{RequestHandler, WorkItem};
use crate::worker::{HostLoad, NoHostLoad, WorkerPool, WorkerStatus};
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};
use turnstile_core::error::{Error, Result};
use turnstile_core::{
    NoopMetrics, SchedulerConfig, SchedulerMetrics, SchedulingContext, TimeProvider,
    WallClockTime,
};

/// Lane label used in metrics for bare work
const BARE_WORK_LANE: &str = "<bare>";

// ============================================================================
// SchedulerBuilder
// ============================================================================

/// Builder for creating a scheduler
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    time: Option<Arc<dyn TimeProvider>>,
    metrics: Option<Arc<dyn SchedulerMetrics>>,
    host_load: Option<Arc<dyn HostLoad>>,
}

impl SchedulerBuilder {
    /// Create a new scheduler builder
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            time: None,
            metrics: None,
            host_load: None,
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time provider (default: wall clock)
    pub fn with_time(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the metrics sink (default: no-op)
    pub fn with_metrics(mut self, metrics: Arc<dyn SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the host load provider consulted before thread injection
    pub fn with_host_load(mut self, host_load: Arc<dyn HostLoad>) -> Self {
        self.host_load = Some(host_load);
        self
    }

    /// Validate the configuration and build the scheduler
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;

        let time = self
            .time
            .unwrap_or_else(|| Arc::new(WallClockTime::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let host_load = self.host_load.unwrap_or_else(|| Arc::new(NoHostLoad));

        let run_queue = Arc::new(RunQueue::new());
        let pool = WorkerPool::new(
            self.config.clone(),
            run_queue.clone(),
            time.clone(),
            metrics.clone(),
            host_load,
        );

        Ok(Scheduler {
            limits: TurnLimits::from_config(&self.config),
            config: self.config,
            run_queue,
            pool,
            directory: DashMap::new(),
            time,
            metrics,
            application_turns_stopped: AtomicBool::new(false),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Aggregate scheduler statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStats {
    /// Per-lane statistics, ordered by lane name
    pub groups: Vec<GroupStats>,
    pub system_queue_len: usize,
    pub application_queue_len: usize,
    pub active_workers: usize,
    pub retiring_workers: usize,
    pub application_turns_stopped: bool,
}

impl SchedulerStats {
    /// Total items processed across all lanes
    pub fn total_processed(&self) -> u64 {
        self.groups.iter().map(|g| g.total_processed).sum()
    }

    /// Total items queued across all lanes
    pub fn total_queued(&self) -> usize {
        self.groups.iter().map(|g| g.queue_len).sum()
    }
}

/// The lane scheduler
///
/// Multiplexes the worker pool across registered lanes while guaranteeing
/// that each lane executes at most one turn at a time, in FIFO order.
pub struct Scheduler {
    config: SchedulerConfig,
    run_queue: Arc<RunQueue>,
    pool: WorkerPool,
    directory: DashMap<SchedulingContext, Arc<WorkItemGroup>>,
    limits: TurnLimits,
    time: Arc<dyn TimeProvider>,
    metrics: Arc<dyn SchedulerMetrics>,
    application_turns_stopped: AtomicBool,
}

impl Scheduler {
    /// Create a builder
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Create a scheduler with the given configuration and default collaborators
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        SchedulerBuilder::new().with_config(config).build()
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(workers = self.config.worker_threads_count))]
    pub fn start(&self) -> Result<()> {
        info!("Starting scheduler");
        self.pool.start()
    }

    /// Stop every lane, run down the run queue, and stop the worker pool
    ///
    /// Queued work is discarded; turns in progress finish their current item.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        info!(lanes = self.directory.len(), "Stopping scheduler");
        let application_stopped = self.application_turns_stopped.load(Ordering::SeqCst);

        let mut dropped = 0;
        for group in self.groups() {
            if application_stopped && !group.is_system_priority() {
                continue;
            }
            dropped += group.stop();
        }
        let run_down = self.run_queue.run_down();
        debug!(dropped, run_down, "Lanes stopped and run queue drained");

        self.pool.stop();
    }

    /// Stop every application lane while system lanes keep running
    ///
    /// Later enqueues targeting application lanes are discarded.
    #[instrument(skip(self))]
    pub fn stop_application_work(&self) {
        if self.application_turns_stopped.swap(true, Ordering::SeqCst) {
            debug!("Application work already stopped");
            return;
        }

        let mut lanes = 0;
        let mut dropped = 0;
        for group in self.groups() {
            if !group.is_system_priority() {
                lanes += 1;
                dropped += group.stop();
            }
        }
        let run_down = self.run_queue.run_down_application();
        info!(lanes, dropped, run_down, "Application work stopped");
    }

    /// Whether the worker pool is running
    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Whether `stop_application_work` has been called
    pub fn is_application_work_stopped(&self) -> bool {
        self.application_turns_stopped.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------------

    /// Look up or create the work item group for a lane
    ///
    /// Idempotent: repeated calls return the same group.
    #[instrument(skip(self, context), fields(lane = %context), level = "debug")]
    pub fn register_context(&self, context: &SchedulingContext) -> Arc<WorkItemGroup> {
        self.directory
            .entry(context.clone())
            .or_insert_with(|| {
                debug!("Registering lane");
                WorkItemGroup::new(
                    context.clone(),
                    self.run_queue.clone(),
                    self.limits,
                    self.time.clone(),
                    self.metrics.clone(),
                )
            })
            .value()
            .clone()
    }

    /// Remove a lane from the directory and stop it
    ///
    /// Returns false if the lane was not registered.
    #[instrument(skip(self, context), fields(lane = %context), level = "debug")]
    pub fn unregister_context(&self, context: &SchedulingContext) -> bool {
        match self.directory.remove(context) {
            Some((_, group)) => {
                group.stop();
                true
            }
            None => {
                debug!("Unregistering unknown lane");
                false
            }
        }
    }

    /// Registered group for a lane, if any
    pub fn work_item_group(&self, context: &SchedulingContext) -> Option<Arc<WorkItemGroup>> {
        self.directory.get(context).map(|entry| entry.value().clone())
    }

    /// Number of registered lanes
    pub fn work_item_group_count(&self) -> usize {
        self.directory.len()
    }

    /// Fail unless `context` names a registered lane
    pub fn check_scheduling_context_validity(
        &self,
        context: Option<&SchedulingContext>,
    ) -> Result<()> {
        match context {
            None => Err(Error::invalid_context("<none>", "no scheduling context")),
            Some(context) if self.directory.contains_key(context) => Ok(()),
            Some(context) => Err(Error::invalid_context(
                context.to_string(),
                "context is not registered",
            )),
        }
    }

    /// Continuation adapter for a registered lane
    pub fn task_scheduler(&self, context: &SchedulingContext) -> Result<ActivationTaskScheduler> {
        self.resolve(context).map(|group| group.task_scheduler())
    }

    // ------------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------------

    /// Enqueue a work item on a lane, or as bare work when `context` is `None`
    ///
    /// Only an unregistered context is an error. Work for a stopped lane, or
    /// for an application lane after `stop_application_work`, is accepted and
    /// discarded.
    pub fn enqueue(&self, mut item: WorkItem, context: Option<&SchedulingContext>) -> Result<()> {
        let Some(context) = context else {
            item.set_context(None);
            item.stamp_enqueued(self.time.monotonic_ms());
            self.metrics
                .work_item_enqueued(BARE_WORK_LANE, self.run_queue.system_len());
            self.run_queue.publish(item);
            return Ok(());
        };

        let group = self.resolve(context)?;
        if !group.is_system_priority() && self.is_application_work_stopped() {
            warn!(
                lane = %group.name(),
                item = %item.name(),
                "Application work stopped, ignoring work item"
            );
            self.metrics.work_items_dropped(group.name(), 1);
            item.ignore("application work stopped");
            return Ok(());
        }

        group.enqueue(item);
        Ok(())
    }

    /// Enqueue a closure on a lane
    pub fn enqueue_closure<F>(
        &self,
        context: Option<&SchedulingContext>,
        name: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&TurnContext) + Send + 'static,
    {
        self.enqueue(WorkItem::closure(name, f), context)
    }

    /// Dispatch a request to `handler` on a lane
    ///
    /// The receiver yields the handler's reply, or `WorkItemDropped` if the
    /// lane stops first.
    pub fn request(
        &self,
        context: &SchedulingContext,
        handler: Arc<dyn RequestHandler>,
        operation: impl Into<String>,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let (item, reply_rx) = WorkItem::request(handler, operation, payload);
        self.enqueue(item, Some(context))?;
        Ok(reply_rx)
    }

    /// Deliver a response to `callback` on a lane
    pub fn respond<F>(
        &self,
        context: &SchedulingContext,
        name: impl Into<String>,
        result: Result<Bytes>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        self.enqueue(WorkItem::response(name, result, callback), Some(context))
    }

    /// Spawn a future bound to a lane
    pub fn spawn<F, T>(
        &self,
        context: &SchedulingContext,
        name: impl Into<String>,
        future: F,
    ) -> Result<LaneJoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.task_scheduler(context)?.spawn(name, future))
    }

    // ------------------------------------------------------------------------
    // Health and statistics
    // ------------------------------------------------------------------------

    /// Health signal for an external liveness probe
    pub fn check_health(&self) -> bool {
        self.pool.check_health()
    }

    /// Number of live worker threads
    pub fn active_worker_count(&self) -> usize {
        self.pool.active_worker_count()
    }

    /// Snapshot of every live worker
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.pool.worker_statuses()
    }

    /// Units waiting on the run queue
    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> SchedulerStats {
        let mut groups: Vec<GroupStats> = self.groups().iter().map(|g| g.stats()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        SchedulerStats {
            groups,
            system_queue_len: self.run_queue.system_len(),
            application_queue_len: self.run_queue.application_len(),
            active_workers: self.pool.active_worker_count(),
            retiring_workers: self.pool.retiring_worker_count(),
            application_turns_stopped: self.is_application_work_stopped(),
        }
    }

    /// Multi-line human-readable status of the run queue, workers and lanes
    pub fn dump_status(&self) -> String {
        let mut out = format!(
            "RunQueue: system={} application={}\n",
            self.run_queue.system_len(),
            self.run_queue.application_len()
        );
        for worker in self.pool.worker_statuses() {
            out.push_str(&format!(
                "Worker {} ({}): {}{}\n",
                worker.id,
                worker.kind,
                match (&worker.current_item, worker.turn_elapsed_ms) {
                    (Some(item), Some(elapsed_ms)) => format!("running {} for {}ms", item, elapsed_ms),
                    _ => "idle".to_string(),
                },
                if worker.retiring { " [retiring]" } else { "" }
            ));
        }
        let mut lanes: Vec<String> = self.groups().iter().map(|g| g.dump_status()).collect();
        lanes.sort();
        for lane in lanes {
            out.push_str(&lane);
            out.push('\n');
        }
        out
    }

    /// Log aggregate statistics at info level
    pub fn print_statistics(&self) {
        let stats = self.stats();
        info!(
            lanes = stats.groups.len(),
            processed = stats.total_processed(),
            queued = stats.total_queued(),
            system_queue_len = stats.system_queue_len,
            application_queue_len = stats.application_queue_len,
            active_workers = stats.active_workers,
            retiring_workers = stats.retiring_workers,
            "Scheduler statistics"
        );
        for group in &stats.groups {
            info!(
                lane = %group.name,
                state = %group.state,
                queue_len = group.queue_len,
                enqueued = group.total_enqueued,
                processed = group.total_processed,
                quantum_expirations = group.quantum_expirations,
                average_queue_delay_ms = group.average_queue_delay_ms,
                "Lane statistics"
            );
        }
    }

    fn resolve(&self, context: &SchedulingContext) -> Result<Arc<WorkItemGroup>> {
        self.work_item_group(context).ok_or_else(|| {
            error!(lane = %context, "Work targeted an unregistered scheduling context");
            Error::invalid_context(context.to_string(), "context is not registered")
        })
    }

    // Cloned out so no directory shard lock is held while groups run stop().
    fn groups(&self) -> Vec<Arc<WorkItemGroup>> {
        self.directory
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("lanes", &self.directory.len())
            .field("run_queue_len", &self.run_queue.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.pool.is_running() {
            self.stop();
        } else {
            // Queued group turns hold their groups, which hold the run queue.
            self.run_queue.run_down();
        }
    }
}
