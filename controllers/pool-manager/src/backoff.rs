//! # Exponential Backoff
//!
//! Provides a bounded exponential backoff for reopening the node watch.
//! Failed watches and watches closed right away without delivering events
//! consume the backoff, so a misbehaving API server or proxy does not turn
//! the watch loop into a busy retry. A healthy close resets it.
//!
//! Sequence with the defaults: 1s, 2s, 4s, 8s, 16s, 32s, 60s (max).

use std::time::Duration;

/// Default first delay
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Default delay cap
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff calculator
///
/// Each delay doubles the previous one, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (also used after reset)
    min: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given first delay and cap
    ///
    /// A zero `min` yields zero delays, which is useful in tests.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min.min(max),
            max,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min.min(self.max);
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}
