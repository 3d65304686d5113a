//! Turn context and cooperative cancellation
//!
//! TigerStyle: The "current lane" is an explicit value, never ambient state.
//!
//! A [`TurnContext`] is created by the worker loop for every unit it executes
//! and narrowed to a lane by `WorkItemGroup` while that lane's turn runs. It is
//! handed by reference to every work item, so inline-execution checks compare
//! against a value the caller can see rather than thread-local identity.
//!
//! A lane-scoped context cannot be built outside this crate, copied, or
//! shared with another thread. Each one carries the [`TurnToken`] its group
//! recorded when the turn started.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use turnstile_core::SchedulingContext;

/// Identifier for a worker thread
pub type WorkerId = usize;

/// Process-wide turn sequence; zero is never issued
static TURN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// CancellationToken
// ============================================================================

/// Pool-wide cooperative cancellation flag
///
/// Checked by idle workers between dequeues and by groups between items.
/// Never interrupts a running item.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TurnToken
// ============================================================================

/// Identity of one lane turn: the executing worker plus a unique sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TurnToken {
    worker_id: WorkerId,
    sequence: u64,
}

impl TurnToken {
    fn issue(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            sequence: TURN_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

// ============================================================================
// TurnContext
// ============================================================================

/// Execution context passed to every work item
///
/// Neither `Clone` nor `Sync`: a work item only ever sees it by reference on
/// the worker thread that runs the turn.
#[derive(Debug)]
pub struct TurnContext {
    worker_id: WorkerId,
    lane: Option<(SchedulingContext, TurnToken)>,
    cancel: CancellationToken,
    _not_sync: PhantomData<Cell<()>>,
}

impl TurnContext {
    /// Context for a worker that is not inside any lane
    pub(crate) fn new(worker_id: WorkerId, cancel: CancellationToken) -> Self {
        Self {
            worker_id,
            lane: None,
            cancel,
            _not_sync: PhantomData,
        }
    }

    /// Context for code running outside the worker pool (tests, inline callers)
    ///
    /// Never inside a lane, so it cannot be used to run lane work inline.
    pub fn detached() -> Self {
        Self::new(WorkerId::MAX, CancellationToken::new())
    }

    /// Narrow this context to a lane for the duration of one turn
    ///
    /// Issues a fresh token that the group records while the turn runs.
    pub(crate) fn enter_lane(&self, lane: &SchedulingContext) -> Self {
        debug_assert!(
            self.lane.is_none(),
            "turns do not nest: already inside a lane"
        );
        Self {
            worker_id: self.worker_id,
            lane: Some((lane.clone(), TurnToken::issue(self.worker_id))),
            cancel: self.cancel.clone(),
            _not_sync: PhantomData,
        }
    }

    /// Worker executing this turn
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Lane whose turn is executing, `None` for bare top-level work
    pub fn lane(&self) -> Option<&SchedulingContext> {
        self.lane.as_ref().map(|(lane, _)| lane)
    }

    /// Token of the lane turn, `None` outside a lane
    pub(crate) fn token(&self) -> Option<TurnToken> {
        self.lane.as_ref().map(|(_, token)| *token)
    }

    /// Whether this turn belongs to exactly the given lane
    pub fn is_executing(&self, lane: &SchedulingContext) -> bool {
        self.lane() == Some(lane)
    }

    /// Whether the pool has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
