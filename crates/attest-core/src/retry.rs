use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff policy shared by every network-facing operation in
/// the harness.
///
/// One policy type, used identically by the health prober and the tool
/// invoker, so every external call has the same retry semantics. Attempts
/// are numbered from 1; a policy with `max_retries = r` permits exactly
/// `r + 1` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    /// Must be >= 1.0 (enforced at config load), so delays never decrease.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts this policy permits.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to sleep after the failed attempt numbered `attempt` (1-based),
    /// or `None` when the policy is exhausted and no further attempt should
    /// be made.
    ///
    /// Pure and deterministic; the caller owns the actual sleeping.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts() {
            return None;
        }
        Some(self.delay_for(attempt))
    }

    /// Delay preceding attempt `attempt + 1`: `base * multiplier^(attempt-1)`,
    /// saturating instead of overflowing for large attempt counts.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        if !factor.is_finite() {
            return Duration::MAX;
        }
        let secs = self.base_delay.as_secs_f64() * factor;
        if secs >= Duration::MAX.as_secs_f64() {
            Duration::MAX
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
