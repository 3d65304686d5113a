//! Time abstraction for deterministic testing
//!
//! TigerStyle: All clock reads go through [`TimeProvider`].
//!
//! Turn quanta, long-turn warnings, queue delays and stuck-worker detection
//! are all measured against a `TimeProvider`, so the same scheduling code runs
//! against the wall clock in production and against [`ManualClock`] in tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Scheduler / WorkItemGroup / WorkerPool    │
//! └──────────────────────┬──────────────────────┘
//!                        │ monotonic_ms()
//!           ┌────────────┴────────────┐
//!     ┌─────▼─────┐            ┌──────▼──────┐
//!     │ WallClock │            │ ManualClock │
//!     └───────────┘            └─────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// Time Provider
// ============================================================================

/// Monotonic time source
///
/// Never read `std::time::Instant::now()` directly in scheduling code.
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since an arbitrary, fixed origin
    fn monotonic_ms(&self) -> u64;

    /// Milliseconds elapsed since `since_ms` (saturating)
    fn elapsed_ms(&self, since_ms: u64) -> u64 {
        self.monotonic_ms().saturating_sub(since_ms)
    }
}

/// Production time provider backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct WallClockTime {
    origin: Instant,
}

impl WallClockTime {
    /// Create a new wall clock time provider
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClockTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for WallClockTime {
    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

// ============================================================================
// Manual Clock
// ============================================================================

/// Explicitly advanced clock
///
/// Time only moves when [`ManualClock::advance_ms`] is called, which makes
/// quantum expiry and long-turn detection reproducible. Clones share time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at the given millisecond timestamp
    pub fn from_millis(ms: u64) -> Self {
        Self {
            current_ms: Arc::new(AtomicU64::new(ms)),
        }
    }

    /// Advance time by the given number of milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Get the current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}

impl TimeProvider for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_is_monotonic() {
        let clock = WallClockTime::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::from_millis(100);
        assert_eq!(clock.monotonic_ms(), 100);

        clock.advance_ms(50);
        assert_eq!(clock.monotonic_ms(), 150);
        assert_eq!(clock.elapsed_ms(120), 30);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        clock.advance_ms(7);
        assert_eq!(shared.now_ms(), 7);
    }

    #[test]
    fn test_elapsed_saturates() {
        let clock = ManualClock::from_millis(10);
        assert_eq!(clock.elapsed_ms(20), 0);
    }
}
