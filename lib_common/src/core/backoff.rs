//! # Backoff Policy
//!
//! Exponential delay between reconnect attempts:
//! `delay(n) = min(initial * multiplier^(n-1), cap)` for attempt `n >= 1`.

use std::time::Duration;

/// Pure value describing the reconnect delays. Recomputed per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt.
    pub initial: Duration,
    /// Growth factor per attempt.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    /// 1s, doubling, capped at 60s.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Doubling policy between `initial` and `cap`.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            multiplier: 2,
            cap,
        }
    }

    /// Delay to wait before attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        self.multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
