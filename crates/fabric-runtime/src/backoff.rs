//! # Exponential Backoff
//!
//! Exponential backoff applied by the controller runner when a reconcile
//! fails. Each object doubles its delay on every consecutive failure, starting
//! at `base` and capped at `max`. A successful reconcile forgets the object so
//! the next failure starts over.
//!
//! Default sequence: 5ms, 10ms, 20ms, 40ms, ... up to 1000s, the same curve the
//! upstream Kubernetes controllers use for their item rate limiter.

use std::time::Duration;

/// Default initial delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Generates `base * 2^n` for the n-th consecutive failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.failures, self.base, self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Number of failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Calculate the delay for a given error count (stateless)
    ///
    /// `error_count` is 0-indexed: the first failure waits `base`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        // 2^31 overflows any sane base; clamp the exponent early
        let factor = 1u32.checked_shl(error_count.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}
