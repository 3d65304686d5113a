//! Turnstile Core
//!
//! Core types, errors, configuration and constants for the turnstile lane
//! scheduler.
//!
//! # Overview
//!
//! Turnstile multiplexes a small pool of worker threads across many
//! logically single-threaded lanes (activations, system targets). This crate
//! holds the pieces shared by the scheduler and its callers: lane identity,
//! configuration, the time abstraction, and the metrics interface.
//!
//! # TigerStyle
//!
//! - Explicit limits with big-endian naming (e.g., `WORKER_THREADS_COUNT_MAX`)
//! - Assertions on state-machine transitions
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod io;
pub mod metrics;
pub mod telemetry;

pub use config::SchedulerConfig;
pub use constants::*;
pub use context::{ContextKey, ContextKind, SchedulingContext};
pub use error::{Error, Result};
pub use io::{ManualClock, TimeProvider, WallClockTime};
#[cfg(feature = "otel")]
pub use metrics::OtelMetrics;
pub use metrics::{CountingMetrics, MetricsSnapshot, NoopMetrics, SchedulerMetrics};
pub use telemetry::{init_telemetry, TelemetryConfig};
