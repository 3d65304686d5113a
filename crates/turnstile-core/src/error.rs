//! Error types for turnstile
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use thiserror::Error;

/// Result type alias for turnstile operations
pub type Result<T> = std::result::Result<T, Error>;

/// Turnstile error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Scheduling Context Errors
    // =========================================================================
    #[error("Invalid scheduling context: {context}, reason: {reason}")]
    InvalidSchedulingContext { context: String, reason: String },

    #[error("Invalid context key: {key}, reason: {reason}")]
    InvalidContextKey { key: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Scheduler already started")]
    SchedulerAlreadyStarted,

    #[error("Scheduler is not running")]
    SchedulerNotRunning,

    #[error("Worker spawn failed: {reason}")]
    WorkerSpawnFailed { reason: String },

    // =========================================================================
    // Work Item Errors
    // =========================================================================
    #[error("Work item dropped without execution: {name}, reason: {reason}")]
    WorkItemDropped { name: String, reason: String },

    #[error("Handler failed: {name}, reason: {reason}")]
    HandlerFailed { name: String, reason: String },

    #[error("Handler panicked: {name}, message: {message}")]
    HandlerPanicked { name: String, message: String },

    #[error("Task cancelled before completion: {name}")]
    TaskCancelled { name: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid scheduling context error
    pub fn invalid_context(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedulingContext {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Create a work item dropped error
    pub fn dropped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkItemDropped {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler failed error
    pub fn handler_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandlerFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Check if the work never ran because its lane or the scheduler was stopped
    pub fn is_dropped(&self) -> bool {
        matches!(
            self,
            Self::WorkItemDropped { .. } | Self::TaskCancelled { .. }
        )
    }
}
