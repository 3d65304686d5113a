//! Scheduling context identity
//!
//! TigerStyle: Immutable identity, validated on construction.
//!
//! A [`SchedulingContext`] names one logically single-threaded lane: an
//! activation, a system target, or a bare system thread. Equality and hashing
//! cover `(kind, key)` only; the priority flag classifies the lane but does not
//! distinguish it.

use crate::constants::CONTEXT_KEY_LENGTH_BYTES_MAX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// =============================================================================
// ContextKind
// =============================================================================

/// What kind of entity owns a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// An application activation (grain instance)
    Activation,
    /// A runtime-internal addressable target
    SystemTarget,
    /// A bare runtime thread with no addressable target
    SystemThread,
}

impl ContextKind {
    /// Whether lanes of this kind belong to the runtime rather than the application
    pub fn is_system(&self) -> bool {
        matches!(self, ContextKind::SystemTarget | ContextKind::SystemThread)
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::Activation => write!(f, "Activation"),
            ContextKind::SystemTarget => write!(f, "SystemTarget"),
            ContextKind::SystemThread => write!(f, "SystemThread"),
        }
    }
}

// =============================================================================
// ContextKey
// =============================================================================

/// Opaque, cheaply cloneable key identifying a lane within its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextKey(Arc<str>);

impl ContextKey {
    /// Create a new key with validation
    ///
    /// # Errors
    /// Returns error if the key is empty, too long, or contains control characters.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();

        if key.is_empty() {
            return Err(Error::InvalidContextKey {
                key,
                reason: "key must not be empty".into(),
            });
        }

        if key.len() > CONTEXT_KEY_LENGTH_BYTES_MAX {
            return Err(Error::InvalidContextKey {
                reason: format!(
                    "length {} exceeds limit {}",
                    key.len(),
                    CONTEXT_KEY_LENGTH_BYTES_MAX
                ),
                key,
            });
        }

        if key.chars().any(char::is_control) {
            return Err(Error::InvalidContextKey {
                key,
                reason: "key contains control characters".into(),
            });
        }

        Ok(Self(Arc::from(key)))
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContextKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContextKey> for String {
    fn from(key: ContextKey) -> Self {
        key.0.as_ref().to_owned()
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// SchedulingContext
// =============================================================================

/// Identity of one single-concurrency lane
///
/// # TigerStyle
/// - Never mutated after creation
/// - Used only as a directory key and for priority classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingContext {
    kind: ContextKind,
    key: ContextKey,
    system_priority: bool,
}

impl SchedulingContext {
    /// Create a context with explicit fields
    pub fn new(kind: ContextKind, key: ContextKey, system_priority: bool) -> Self {
        Self {
            kind,
            key,
            system_priority,
        }
    }

    /// Context for an application activation (application priority)
    pub fn activation(key: impl Into<String>) -> Result<Self> {
        Ok(Self::new(ContextKind::Activation, ContextKey::new(key)?, false))
    }

    /// Context for a system target (system priority)
    pub fn system_target(key: impl Into<String>) -> Result<Self> {
        Ok(Self::new(ContextKind::SystemTarget, ContextKey::new(key)?, true))
    }

    /// Context for a system target that competes with application work
    pub fn low_priority_system_target(key: impl Into<String>) -> Result<Self> {
        Ok(Self::new(
            ContextKind::SystemTarget,
            ContextKey::new(key)?,
            false,
        ))
    }

    /// Context for a bare runtime thread (system priority)
    pub fn system_thread(key: impl Into<String>) -> Result<Self> {
        Ok(Self::new(ContextKind::SystemThread, ContextKey::new(key)?, true))
    }

    /// Get the context kind
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Get the context key
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Whether work on this lane is dispatched on the system-priority lane
    pub fn is_system_priority(&self) -> bool {
        self.system_priority
    }

    /// Whether this lane belongs to the runtime rather than an activation
    pub fn is_system(&self) -> bool {
        self.kind.is_system()
    }

    /// Human-readable lane name used in logs and statistics
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl PartialEq for SchedulingContext {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key == other.key
    }
}

impl Eq for SchedulingContext {}

impl Hash for SchedulingContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for SchedulingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.kind, self.key)
    }
}
