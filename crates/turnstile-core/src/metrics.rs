//! Metrics registry interface for the scheduler
//!
//! TigerStyle: Explicit metric names with units, passed in as a dependency.
//!
//! The scheduler never discovers counters on its own; it calls into the
//! [`SchedulerMetrics`] it was built with. [`NoopMetrics`] is the default,
//! [`CountingMetrics`] keeps in-process totals, and `OtelMetrics` (behind the
//! `otel` feature) records through OpenTelemetry.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "otel")]
use crate::constants::*;
#[cfg(feature = "otel")]
use opentelemetry::metrics::{Counter, Histogram};
#[cfg(feature = "otel")]
use opentelemetry::{global, KeyValue};

/// Sink for scheduler instrumentation
pub trait SchedulerMetrics: Send + Sync + std::fmt::Debug {
    /// A work item was appended to a lane (or to the run queue for bare work)
    fn work_item_enqueued(&self, lane: &str, queue_len: usize);

    /// Work items were discarded without execution
    fn work_items_dropped(&self, lane: &str, count: usize);

    /// A lane finished a turn
    fn turn_completed(&self, lane: &str, items: u64, duration_ms: u64, quantum_expired: bool);

    /// A single work item ran past the turn warning threshold
    fn long_running_item(&self, lane: &str, duration_ms: u64);

    /// A work item waited in queue past the delay warning threshold
    fn queue_delay_exceeded(&self, lane: &str, delay_ms: u64);

    /// A replacement worker was injected for a stuck one
    fn worker_injected(&self);

    /// A replaced worker finished its turn and left the pool
    fn worker_retired(&self);

    /// A worker loop exited on an escaped panic
    fn worker_crashed(&self);
}

// ============================================================================
// NoopMetrics
// ============================================================================

/// Metrics sink that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SchedulerMetrics for NoopMetrics {
    fn work_item_enqueued(&self, _lane: &str, _queue_len: usize) {}
    fn work_items_dropped(&self, _lane: &str, _count: usize) {}
    fn turn_completed(&self, _lane: &str, _items: u64, _duration_ms: u64, _quantum_expired: bool) {}
    fn long_running_item(&self, _lane: &str, _duration_ms: u64) {}
    fn queue_delay_exceeded(&self, _lane: &str, _delay_ms: u64) {}
    fn worker_injected(&self) {}
    fn worker_retired(&self) {}
    fn worker_crashed(&self) {}
}

// ============================================================================
// CountingMetrics
// ============================================================================

/// Point-in-time copy of [`CountingMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub work_items_enqueued: u64,
    pub work_items_dropped: u64,
    pub turns: u64,
    pub items_executed: u64,
    pub quantum_expirations: u64,
    pub long_running_items: u64,
    pub queue_delays_exceeded: u64,
    pub workers_injected: u64,
    pub workers_retired: u64,
    pub workers_crashed: u64,
}

/// Aggregate in-process counters
#[derive(Debug, Default)]
pub struct CountingMetrics {
    work_items_enqueued: AtomicU64,
    work_items_dropped: AtomicU64,
    turns: AtomicU64,
    items_executed: AtomicU64,
    quantum_expirations: AtomicU64,
    long_running_items: AtomicU64,
    queue_delays_exceeded: AtomicU64,
    workers_injected: AtomicU64,
    workers_retired: AtomicU64,
    workers_crashed: AtomicU64,
}

impl CountingMetrics {
    /// Create a new zeroed counter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current totals
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            work_items_enqueued: self.work_items_enqueued.load(Ordering::Relaxed),
            work_items_dropped: self.work_items_dropped.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
            items_executed: self.items_executed.load(Ordering::Relaxed),
            quantum_expirations: self.quantum_expirations.load(Ordering::Relaxed),
            long_running_items: self.long_running_items.load(Ordering::Relaxed),
            queue_delays_exceeded: self.queue_delays_exceeded.load(Ordering::Relaxed),
            workers_injected: self.workers_injected.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
            workers_crashed: self.workers_crashed.load(Ordering::Relaxed),
        }
    }
}

impl SchedulerMetrics for CountingMetrics {
    fn work_item_enqueued(&self, _lane: &str, _queue_len: usize) {
        self.work_items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn work_items_dropped(&self, _lane: &str, count: usize) {
        self.work_items_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn turn_completed(&self, _lane: &str, items: u64, _duration_ms: u64, quantum_expired: bool) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        self.items_executed.fetch_add(items, Ordering::Relaxed);
        if quantum_expired {
            self.quantum_expirations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn long_running_item(&self, _lane: &str, _duration_ms: u64) {
        self.long_running_items.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_delay_exceeded(&self, _lane: &str, _delay_ms: u64) {
        self.queue_delays_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_injected(&self) {
        self.workers_injected.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_retired(&self) {
        self.workers_retired.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_crashed(&self) {
        self.workers_crashed.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// OtelMetrics
// ============================================================================

/// OpenTelemetry-backed metrics sink
///
/// Instruments are created once from the global meter provider and reused.
#[cfg(feature = "otel")]
#[derive(Debug)]
pub struct OtelMetrics {
    enqueued: Counter<u64>,
    dropped: Counter<u64>,
    turns: Counter<u64>,
    turn_duration: Histogram<f64>,
    quantum_expirations: Counter<u64>,
    long_running: Counter<u64>,
    injected: Counter<u64>,
    retired: Counter<u64>,
}

#[cfg(feature = "otel")]
impl OtelMetrics {
    /// Create instruments on the global `turnstile` meter
    pub fn new() -> Self {
        let meter = global::meter("turnstile");
        Self {
            enqueued: meter
                .u64_counter(METRIC_NAME_WORK_ITEMS_ENQUEUED_TOTAL)
                .with_description("Total number of work items enqueued")
                .init(),
            dropped: meter
                .u64_counter(METRIC_NAME_WORK_ITEMS_DROPPED_TOTAL)
                .with_description("Total number of work items discarded without execution")
                .init(),
            turns: meter
                .u64_counter(METRIC_NAME_TURNS_TOTAL)
                .with_description("Total number of turns executed")
                .init(),
            turn_duration: meter
                .f64_histogram(METRIC_NAME_TURN_DURATION_SECONDS)
                .with_description("Turn duration in seconds")
                .init(),
            quantum_expirations: meter
                .u64_counter(METRIC_NAME_QUANTUM_EXPIRATIONS_TOTAL)
                .with_description("Turns ended by item cap or quantum")
                .init(),
            long_running: meter
                .u64_counter(METRIC_NAME_LONG_RUNNING_ITEMS_TOTAL)
                .with_description("Work items exceeding the turn warning threshold")
                .init(),
            injected: meter
                .u64_counter(METRIC_NAME_WORKERS_INJECTED_TOTAL)
                .with_description("Replacement workers injected")
                .init(),
            retired: meter
                .u64_counter(METRIC_NAME_WORKERS_RETIRED_TOTAL)
                .with_description("Replaced workers retired")
                .init(),
        }
    }
}

#[cfg(feature = "otel")]
impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "otel")]
impl SchedulerMetrics for OtelMetrics {
    fn work_item_enqueued(&self, lane: &str, _queue_len: usize) {
        self.enqueued
            .add(1, &[KeyValue::new("lane", lane.to_string())]);
    }

    fn work_items_dropped(&self, lane: &str, count: usize) {
        self.dropped
            .add(count as u64, &[KeyValue::new("lane", lane.to_string())]);
    }

    fn turn_completed(&self, _lane: &str, _items: u64, duration_ms: u64, quantum_expired: bool) {
        self.turns.add(1, &[]);
        self.turn_duration.record(duration_ms as f64 / 1000.0, &[]);
        if quantum_expired {
            self.quantum_expirations.add(1, &[]);
        }
    }

    fn long_running_item(&self, lane: &str, _duration_ms: u64) {
        self.long_running
            .add(1, &[KeyValue::new("lane", lane.to_string())]);
    }

    fn queue_delay_exceeded(&self, _lane: &str, _delay_ms: u64) {}

    fn worker_injected(&self) {
        self.injected.add(1, &[]);
    }

    fn worker_retired(&self) {
        self.retired.add(1, &[]);
    }

    fn worker_crashed(&self) {}
}
