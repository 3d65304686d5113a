//! Global run queue
//!
//! TigerStyle: Two priority lanes, bounded waits, explicit rundown.
//!
//! Holds runnable lanes (as `GroupTurn` items) and bare top-level work.
//! System-priority entries go on the system lane, which the dedicated system
//! worker drains exclusively and application workers check first.

use crate::work_item::WorkItem;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct RunDown {
    application: bool,
    system: bool,
}

/// Two-priority queue of runnable units
#[derive(Debug)]
pub struct RunQueue {
    system_tx: Sender<WorkItem>,
    system_rx: Receiver<WorkItem>,
    application_tx: Sender<WorkItem>,
    application_rx: Receiver<WorkItem>,
    run_down: RwLock<RunDown>,
}

impl RunQueue {
    /// Create an empty run queue
    pub fn new() -> Self {
        let (system_tx, system_rx) = unbounded();
        let (application_tx, application_rx) = unbounded();
        Self {
            system_tx,
            system_rx,
            application_tx,
            application_rx,
            run_down: RwLock::new(RunDown::default()),
        }
    }

    /// Place a runnable unit on the lane matching its priority
    ///
    /// After the lane has been run down the unit is ignored instead.
    pub fn publish(&self, item: WorkItem) {
        let system = item.is_system_priority();
        let rejected = {
            let run_down = self.run_down.read();
            let stopped = if system {
                run_down.system
            } else {
                run_down.application
            };
            if stopped {
                Some(item)
            } else {
                let tx = if system {
                    &self.system_tx
                } else {
                    &self.application_tx
                };
                // Both receivers live as long as self, so send cannot fail.
                tx.send(item).err().map(|e| e.into_inner())
            }
        };

        if let Some(item) = rejected {
            debug!(item = %item.name(), system, "Run queue stopped, ignoring work item");
            item.ignore("run queue stopped");
        }
    }

    /// Blocking dequeue from the system lane only
    pub fn take_system(&self, timeout: Duration) -> Option<WorkItem> {
        self.system_rx.recv_timeout(timeout).ok()
    }

    /// Blocking dequeue from either lane, preferring system work
    pub fn take_any(&self, timeout: Duration) -> Option<WorkItem> {
        if let Ok(item) = self.system_rx.try_recv() {
            return Some(item);
        }
        if let Ok(item) = self.application_rx.try_recv() {
            return Some(item);
        }
        select! {
            recv(self.system_rx) -> msg => msg.ok(),
            recv(self.application_rx) -> msg => msg.ok(),
            default(timeout) => None,
        }
    }

    /// Stop accepting application work and ignore what is queued
    ///
    /// Returns the number of units discarded.
    pub fn run_down_application(&self) -> usize {
        self.run_down.write().application = true;
        Self::drain(&self.application_rx)
    }

    /// Stop accepting any work and ignore everything queued
    pub fn run_down(&self) -> usize {
        {
            let mut run_down = self.run_down.write();
            run_down.application = true;
            run_down.system = true;
        }
        Self::drain(&self.application_rx) + Self::drain(&self.system_rx)
    }

    fn drain(rx: &Receiver<WorkItem>) -> usize {
        let drained: Vec<WorkItem> = rx.try_iter().collect();
        let count = drained.len();
        for item in drained {
            item.ignore("run queue stopped");
        }
        count
    }

    /// Total queued units
    pub fn len(&self) -> usize {
        self.system_rx.len() + self.application_rx.len()
    }

    /// Whether both lanes are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Units queued on the system lane
    pub fn system_len(&self) -> usize {
        self.system_rx.len()
    }

    /// Units queued on the application lane
    pub fn application_len(&self) -> usize {
        self.application_rx.len()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
