//! TigerStyle constants for turnstile
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Scheduling Context Limits
// =============================================================================

/// Maximum length of a scheduling context key in bytes
pub const CONTEXT_KEY_LENGTH_BYTES_MAX: usize = 512;

// =============================================================================
// Worker Pool Limits
// =============================================================================

/// Maximum number of application worker threads
pub const WORKER_THREADS_COUNT_MAX: usize = 1024;

/// Number of dedicated system-priority worker threads
pub const WORKER_SYSTEM_THREADS_COUNT: usize = 1;

/// Default bounded wait for a worker dequeue in milliseconds
///
/// Idle workers re-check the cancellation token at this interval.
pub const WORKER_TAKE_TIMEOUT_MS_DEFAULT: u64 = 50;

/// Maximum bounded wait for a worker dequeue in milliseconds (1 sec)
pub const WORKER_TAKE_TIMEOUT_MS_MAX: u64 = 1000;

/// Default interval between stuck-worker checks in milliseconds
pub const INJECTION_CHECK_INTERVAL_MS_DEFAULT: u64 = 500;

/// Default budget of concurrently live replacement workers
pub const INJECTED_WORKERS_COUNT_MAX_DEFAULT: usize = 16;

/// Default CPU usage ceiling above which no replacement worker is injected
pub const INJECTION_CPU_USAGE_PERCENT_MAX_DEFAULT: f32 = 90.0;

/// How long pool stop waits for workers to exit before detaching them (5 sec)
pub const WORKER_STOP_WAIT_MS_MAX: u64 = 5 * 1000;

// =============================================================================
// Turn Limits
// =============================================================================

/// Default cap on work items per turn (<= 0 means drain fully)
pub const TURN_WORK_ITEMS_COUNT_MAX_DEFAULT: i64 = 0;

/// Default wall-clock quantum per turn in milliseconds (<= 0 means unlimited)
pub const TURN_QUANTUM_MS_DEFAULT: i64 = 100;

/// Default threshold after which a single item or turn is reported as long
pub const TURN_WARNING_THRESHOLD_MS_DEFAULT: u64 = 200;

/// Default threshold after which queueing delay is reported (10 sec)
pub const QUEUE_DELAY_WARNING_MS_DEFAULT: u64 = 10 * 1000;

/// Default soft limit on pending items per lane (0 disables the warning)
pub const PENDING_WORK_ITEMS_SOFT_LIMIT_DEFAULT: usize = 0;

// =============================================================================
// Observability - Metric Names (TigerStyle: explicit, with units)
// =============================================================================

/// Metric: Total number of work items enqueued (counter, labels: lane)
pub const METRIC_NAME_WORK_ITEMS_ENQUEUED_TOTAL: &str = "turnstile_work_items_enqueued_total";

/// Metric: Total number of work items discarded without execution (counter)
pub const METRIC_NAME_WORK_ITEMS_DROPPED_TOTAL: &str = "turnstile_work_items_dropped_total";

/// Metric: Total number of turns executed (counter)
pub const METRIC_NAME_TURNS_TOTAL: &str = "turnstile_turns_total";

/// Metric: Turn duration in seconds (histogram)
pub const METRIC_NAME_TURN_DURATION_SECONDS: &str = "turnstile_turn_duration_seconds";

/// Metric: Total number of turns ended by item cap or quantum (counter)
pub const METRIC_NAME_QUANTUM_EXPIRATIONS_TOTAL: &str = "turnstile_quantum_expirations_total";

/// Metric: Total number of work items that exceeded the turn warning threshold
pub const METRIC_NAME_LONG_RUNNING_ITEMS_TOTAL: &str = "turnstile_long_running_items_total";

/// Metric: Total number of replacement workers injected (counter)
pub const METRIC_NAME_WORKERS_INJECTED_TOTAL: &str = "turnstile_workers_injected_total";

/// Metric: Total number of workers retired after being replaced (counter)
pub const METRIC_NAME_WORKERS_RETIRED_TOTAL: &str = "turnstile_workers_retired_total";

// Compile-time assertions for constant validity
const _: () = {
    assert!(WORKER_SYSTEM_THREADS_COUNT == 1);
    assert!(WORKER_TAKE_TIMEOUT_MS_DEFAULT > 0);
    assert!(WORKER_TAKE_TIMEOUT_MS_DEFAULT <= WORKER_TAKE_TIMEOUT_MS_MAX);
    assert!(TURN_WARNING_THRESHOLD_MS_DEFAULT > 0);
    assert!(CONTEXT_KEY_LENGTH_BYTES_MAX >= 64);
};
