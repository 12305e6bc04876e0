//! Exponential reconnect backoff.
//!
//! The policy is a pure function of the attempt number. Whoever owns the
//! reconnect timer tracks whether one is already scheduled and resets the
//! attempt counter after every successful connection.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Default ceiling on the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(15_000);

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt - 1), max)`, with `attempt` normalized to at
    /// least 1. Saturates rather than overflowing for large attempts.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// [`ReconnectPolicy::delay`] with the default parameters.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    ReconnectPolicy::default().delay(attempt)
}
