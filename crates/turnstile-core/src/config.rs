//! Configuration for the scheduler
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Scheduler configuration
///
/// Turn limits follow the "<= 0 means unlimited" convention: a turn drains
/// the lane until whichever bounded limit trips first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of application worker threads (one system worker is always added)
    #[serde(default = "default_worker_threads_count")]
    pub worker_threads_count: usize,

    /// Maximum work items per turn (<= 0 means unlimited)
    #[serde(default = "default_turn_work_items_max")]
    pub turn_work_items_max: i64,

    /// Wall-clock quantum per turn in milliseconds (<= 0 means unlimited)
    #[serde(default = "default_turn_quantum_ms")]
    pub turn_quantum_ms: i64,

    /// Items or turns running longer than this are reported (milliseconds)
    #[serde(default = "default_turn_warning_threshold_ms")]
    pub turn_warning_threshold_ms: u64,

    /// Items waiting longer than this before execution are reported (milliseconds)
    #[serde(default = "default_queue_delay_warning_ms")]
    pub queue_delay_warning_ms: u64,

    /// Warn when a lane's backlog exceeds this many items (0 disables)
    #[serde(default = "default_pending_work_items_soft_limit")]
    pub pending_work_items_soft_limit: usize,

    /// Whether stuck workers are compensated by injecting replacements
    #[serde(default = "default_thread_injection_enabled")]
    pub thread_injection_enabled: bool,

    /// Interval between stuck-worker checks (milliseconds)
    #[serde(default = "default_injection_check_interval_ms")]
    pub injection_check_interval_ms: u64,

    /// Maximum number of replacement workers alive at once
    #[serde(default = "default_injected_workers_max")]
    pub injected_workers_max: usize,

    /// No replacement is injected while host CPU usage is at or above this
    #[serde(default = "default_injection_cpu_usage_percent_max")]
    pub injection_cpu_usage_percent_max: f32,

    /// Bounded wait for a worker dequeue (milliseconds)
    #[serde(default = "default_worker_take_timeout_ms")]
    pub worker_take_timeout_ms: u64,
}

fn default_worker_threads_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(WORKER_THREADS_COUNT_MAX)
}

fn default_turn_work_items_max() -> i64 {
    TURN_WORK_ITEMS_COUNT_MAX_DEFAULT
}

fn default_turn_quantum_ms() -> i64 {
    TURN_QUANTUM_MS_DEFAULT
}

fn default_turn_warning_threshold_ms() -> u64 {
    TURN_WARNING_THRESHOLD_MS_DEFAULT
}

fn default_queue_delay_warning_ms() -> u64 {
    QUEUE_DELAY_WARNING_MS_DEFAULT
}

fn default_pending_work_items_soft_limit() -> usize {
    PENDING_WORK_ITEMS_SOFT_LIMIT_DEFAULT
}

fn default_thread_injection_enabled() -> bool {
    true
}

fn default_injection_check_interval_ms() -> u64 {
    INJECTION_CHECK_INTERVAL_MS_DEFAULT
}

fn default_injected_workers_max() -> usize {
    INJECTED_WORKERS_COUNT_MAX_DEFAULT
}

fn default_injection_cpu_usage_percent_max() -> f32 {
    INJECTION_CPU_USAGE_PERCENT_MAX_DEFAULT
}

fn default_worker_take_timeout_ms() -> u64 {
    WORKER_TAKE_TIMEOUT_MS_DEFAULT
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads_count: default_worker_threads_count(),
            turn_work_items_max: default_turn_work_items_max(),
            turn_quantum_ms: default_turn_quantum_ms(),
            turn_warning_threshold_ms: default_turn_warning_threshold_ms(),
            queue_delay_warning_ms: default_queue_delay_warning_ms(),
            pending_work_items_soft_limit: default_pending_work_items_soft_limit(),
            thread_injection_enabled: default_thread_injection_enabled(),
            injection_check_interval_ms: default_injection_check_interval_ms(),
            injected_workers_max: default_injected_workers_max(),
            injection_cpu_usage_percent_max: default_injection_cpu_usage_percent_max(),
            worker_take_timeout_ms: default_worker_take_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a (possibly partial) JSON document and validate it
    ///
    /// Absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::InvalidConfiguration {
            field: "<document>".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads_count == 0 {
            return Err(Error::InvalidConfiguration {
                field: "worker_threads_count".into(),
                reason: "must be at least 1".into(),
            });
        }

        if self.worker_threads_count > WORKER_THREADS_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "worker_threads_count".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.worker_threads_count, WORKER_THREADS_COUNT_MAX
                ),
            });
        }

        if self.turn_warning_threshold_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "turn_warning_threshold_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.worker_take_timeout_ms == 0 || self.worker_take_timeout_ms > WORKER_TAKE_TIMEOUT_MS_MAX
        {
            return Err(Error::InvalidConfiguration {
                field: "worker_take_timeout_ms".into(),
                reason: format!("must be in 1..={}", WORKER_TAKE_TIMEOUT_MS_MAX),
            });
        }

        if self.thread_injection_enabled && self.injection_check_interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "injection_check_interval_ms".into(),
                reason: "must be greater than 0 when thread injection is enabled".into(),
            });
        }

        if !(0.0..=100.0).contains(&self.injection_cpu_usage_percent_max) {
            return Err(Error::InvalidConfiguration {
                field: "injection_cpu_usage_percent_max".into(),
                reason: "must be a percentage in 0..=100".into(),
            });
        }

        Ok(())
    }

    /// Per-turn item cap, `None` when unlimited
    pub fn turn_items_cap(&self) -> Option<u64> {
        u64::try_from(self.turn_work_items_max)
            .ok()
            .filter(|cap| *cap > 0)
    }

    /// Per-turn quantum in milliseconds, `None` when unlimited
    pub fn turn_quantum(&self) -> Option<u64> {
        u64::try_from(self.turn_quantum_ms)
            .ok()
            .filter(|quantum| *quantum > 0)
    }
}
