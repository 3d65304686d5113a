//! Turnstile Scheduler
//!
//! Two-level lane scheduler for virtual-actor runtimes.
//!
//! # Overview
//!
//! The scheduler provides:
//! - A global run queue with system and application priority lanes
//! - Per-lane work item groups executing bounded turns in FIFO order
//! - A worker pool with a dedicated system worker
//! - Stuck-worker detection with replacement injection
//! - Lane-bound futures whose continuations resume on their own lane
//!
//! # TigerStyle
//! - At most one turn per lane at any instant
//! - Explicit turn context instead of thread-local state
//! - Bounded turns (item cap and wall-clock quantum)
//! - Cooperative cancellation, never forced termination

pub mod group;
pub mod run_queue;
pub mod scheduler;
pub mod task_scheduler;
pub mod turn;
pub mod work_item;
pub mod worker;

pub use group::{GroupState, GroupStats, WorkItemGroup};
pub use run_queue::RunQueue;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};
pub use task_scheduler::{ActivationTaskScheduler, InlineOutcome, LaneJoinHandle};
pub use turn::{CancellationToken, TurnContext, WorkerId};
pub use work_item::{ClosureFn, RequestHandler, ResponseCallback, WorkItem, WorkItemKind};
pub use worker::{HostLoad, NoHostLoad, WorkerKind, WorkerPool, WorkerStatus};
