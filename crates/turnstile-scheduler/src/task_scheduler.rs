//! Lane-bound continuations
//!
//! TigerStyle: Continuations resume on the lane that spawned them.
//!
//! [`ActivationTaskScheduler`] exposes a [`WorkItemGroup`] to future-based
//! code. A future spawned through it is polled only inside its lane's turns:
//! its waker enqueues a `Continuation` work item onto the same lane, so an
//! `.await` never resumes on an arbitrary thread outside the lane.

use crate::group::WorkItemGroup;
use crate::turn::TurnContext;
use crate::work_item::{panic_message, WorkItem};
use futures::channel::oneshot;
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::trace;
use turnstile_core::error::{Error, Result};
use turnstile_core::SchedulingContext;

type LaneFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// ============================================================================
// LaneTask
// ============================================================================

/// A spawned future owned by one lane
pub(crate) struct LaneTask {
    name: String,
    future: Mutex<Option<LaneFuture>>,
    /// A continuation for this task is already queued
    scheduled: AtomicBool,
    cancelled: AtomicBool,
    group: Weak<WorkItemGroup>,
}

impl LaneTask {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Poll the future once; called by the `Continuation` work item
    pub(crate) fn poll(self: Arc<Self>, turn: &TurnContext) -> Result<()> {
        debug_assert!(
            self.group
                .upgrade()
                .map_or(true, |group| turn.is_executing(group.context())),
            "lane task polled outside its lane"
        );

        self.scheduled.store(false, Ordering::SeqCst);
        let Some(mut future) = self.future.lock().take() else {
            // Completed or cancelled; a stale wake-up.
            return Ok(());
        };

        let waker = waker_ref(&self);
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                trace!(task = %self.name, "Lane task completed");
                Ok(())
            }
            Ok(Poll::Pending) => {
                if !self.cancelled.load(Ordering::SeqCst) {
                    *self.future.lock() = Some(future);
                }
                Ok(())
            }
            Err(panic) => Err(Error::HandlerPanicked {
                name: self.name.clone(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Drop the future without completing it
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let future = self.future.lock().take();
        drop(future);
    }

    fn schedule(self: &Arc<Self>) {
        if self.cancelled.load(Ordering::SeqCst) || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.group.upgrade() {
            Some(group) => group.enqueue(WorkItem::continuation(self.clone())),
            None => self.cancel(),
        }
    }
}

impl ArcWake for LaneTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

// ============================================================================
// LaneJoinHandle
// ============================================================================

/// Completion of a lane-bound future
///
/// Resolves to `TaskCancelled` if the future is dropped before completing,
/// which happens when its lane stops or the future panics.
#[derive(Debug)]
pub struct LaneJoinHandle<T> {
    name: String,
    rx: oneshot::Receiver<T>,
}

impl<T> LaneJoinHandle<T> {
    /// Name of the spawned task
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Future for LaneJoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::TaskCancelled {
                name: this.name.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// ActivationTaskScheduler
// ============================================================================

/// Result of an inline execution attempt
#[derive(Debug)]
pub enum InlineOutcome {
    /// The item ran on the caller's turn; carries its execution result
    Executed(Result<()>),
    /// The caller does not own this lane's turn; the item is handed back
    Rejected(WorkItem),
}

/// Continuation adapter for one lane
#[derive(Debug, Clone)]
pub struct ActivationTaskScheduler {
    group: Arc<WorkItemGroup>,
}

impl ActivationTaskScheduler {
    pub(crate) fn new(group: Arc<WorkItemGroup>) -> Self {
        Self { group }
    }

    /// Lane this adapter schedules onto
    pub fn context(&self) -> &SchedulingContext {
        self.group.context()
    }

    /// Underlying work item group
    pub fn group(&self) -> &Arc<WorkItemGroup> {
        &self.group
    }

    /// Spawn a future whose every poll runs inside this lane
    pub fn spawn<F, T>(&self, name: impl Into<String>, future: F) -> LaneJoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let task = Arc::new(LaneTask {
            name: name.clone(),
            future: Mutex::new(Some(Box::pin(async move {
                let output = future.await;
                // The join handle may have been dropped.
                let _ = tx.send(output);
            }))),
            scheduled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            group: Arc::downgrade(&self.group),
        });
        task.schedule();
        LaneJoinHandle { name, rx }
    }

    /// Queue a work item on this lane
    pub fn queue_work_item(&self, item: WorkItem) {
        self.group.enqueue(item);
    }

    /// Execute `item` on the current thread if `turn` is this lane's running turn
    ///
    /// The lane must be `Running` under exactly this turn's token. Anything
    /// else hands the item back untouched so it can be queued instead.
    pub fn try_run_inline(&self, turn: &TurnContext, item: WorkItem) -> InlineOutcome {
        if !self.group.owns_turn(turn) {
            return InlineOutcome::Rejected(item);
        }
        trace!(lane = %self.group.name(), item = %item.name(), "Running work item inline");
        InlineOutcome::Executed(item.execute(turn))
    }

    /// Run `item` inline when possible, otherwise queue it on this lane
    pub fn run_or_enqueue(&self, turn: &TurnContext, item: WorkItem) -> Result<()> {
        match self.try_run_inline(turn, item) {
            InlineOutcome::Executed(result) => result,
            InlineOutcome::Rejected(item) => {
                self.group.enqueue(item);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupState, TurnLimits};
    use crate::run_queue::RunQueue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use turnstile_core::{ManualClock, NoopMetrics, SchedulerConfig};

    fn make_scheduler(key: &str, run_queue: &Arc<RunQueue>) -> ActivationTaskScheduler {
        let group = WorkItemGroup::new(
            SchedulingContext::activation(key).unwrap(),
            run_queue.clone(),
            TurnLimits::from_config(&SchedulerConfig::default()),
            Arc::new(ManualClock::new()),
            Arc::new(NoopMetrics),
        );
        group.task_scheduler()
    }

    fn drain(run_queue: &RunQueue) {
        while let Some(item) = run_queue.take_any(Duration::from_millis(5)) {
            item.execute(&TurnContext::detached()).unwrap();
        }
    }

    #[test]
    fn test_spawned_future_completes_on_lane() {
        let run_queue = Arc::new(RunQueue::new());
        let scheduler = make_scheduler("grain-1", &run_queue);
        let mut handle = scheduler.spawn("answer", async { 42 });

        drain(&run_queue);
        assert_eq!(futures::executor::block_on(&mut handle).unwrap(), 42);
    }

    #[test]
    fn test_wake_requeues_on_same_lane() {
        let run_queue = Arc::new(RunQueue::new());
        let scheduler = make_scheduler("grain-1", &run_queue);
        let (tx, rx) = oneshot::channel::<u32>();
        let polled = Arc::new(AtomicUsize::new(0));
        let p = polled.clone();

        let handle = scheduler.spawn("waiter", async move {
            p.fetch_add(1, Ordering::SeqCst);
            rx.await.unwrap_or(0) + 1
        });

        drain(&run_queue);
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.group().state(), GroupState::Waiting);

        // Completing the sender wakes the task, which republishes the lane.
        tx.send(9).unwrap();
        assert_eq!(run_queue.application_len(), 1);
        drain(&run_queue);
        assert_eq!(futures::executor::block_on(handle).unwrap(), 10);
    }

    #[test]
    fn test_stopped_lane_cancels_task() {
        let run_queue = Arc::new(RunQueue::new());
        let scheduler = make_scheduler("grain-1", &run_queue);
        let (tx, rx) = oneshot::channel::<u32>();
        let pending = scheduler.spawn("pending", async move { rx.await.unwrap_or(0) });

        drain(&run_queue);
        scheduler.group().stop();

        // Spawning onto a stopped lane drops the future immediately.
        let late = scheduler.spawn("late", async { 1 });
        let err = futures::executor::block_on(late).unwrap_err();
        assert!(matches!(err, Error::TaskCancelled { .. }));

        // A parked task is dropped when its wake-up hits the stopped lane.
        drop(tx);
        let err = futures::executor::block_on(pending).unwrap_err();
        assert!(matches!(err, Error::TaskCancelled { ref name } if name == "pending"));
    }

    #[test]
    fn test_try_run_inline_only_inside_own_turn() {
        let run_queue = Arc::new(RunQueue::new());
        let scheduler = make_scheduler("grain-1", &run_queue);
        let other = make_scheduler("grain-2", &run_queue);
        let hits = Arc::new(AtomicUsize::new(0));

        let make_item = {
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                WorkItem::closure("inline", move |_turn| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }
        };

        // Outside any lane: handed back.
        let outside = TurnContext::detached();
        assert!(matches!(
            scheduler.try_run_inline(&outside, make_item()),
            InlineOutcome::Rejected(_)
        ));

        // Naming the lane without owning its turn: handed back.
        let forged = TurnContext::detached().enter_lane(scheduler.context());
        assert!(matches!(
            scheduler.try_run_inline(&forged, make_item()),
            InlineOutcome::Rejected(_)
        ));

        // Inside this lane's turn: executed. Inside another lane's: handed back.
        let (tx, rx) = std::sync::mpsc::channel();
        let (lane, foreign, make) = (scheduler.clone(), other.clone(), make_item.clone());
        scheduler.queue_work_item(WorkItem::closure("outer", move |turn| {
            let own = matches!(
                lane.try_run_inline(turn, make()),
                InlineOutcome::Executed(Ok(()))
            );
            let elsewhere = matches!(
                foreign.try_run_inline(turn, make()),
                InlineOutcome::Rejected(_)
            );
            tx.send((own, elsewhere)).unwrap();
        }));
        drain(&run_queue);
        assert_eq!(rx.recv().unwrap(), (true, true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // run_or_enqueue falls back to the lane queue.
        scheduler.run_or_enqueue(&outside, make_item()).unwrap();
        assert_eq!(scheduler.group().queue_len(), 1);
        drain(&run_queue);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
