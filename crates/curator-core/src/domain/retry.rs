//! Retry policy: how long a requeued message stays invisible.

use std::time::Duration;

/// Requeue delay policy.
///
/// The fleet default is a fixed one-minute delay (`multiplier == 1.0`):
/// long enough for a flapping network or registry to recover, short
/// enough that a stuck item surfaces within `max_attempts` minutes.
/// Pipelines with slow transient conditions can opt into backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Backoff multiplier, 1.0 for a fixed delay.
    pub multiplier: f64,

    /// Upper bound for any computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    /// `attempts` is 1-based; 0 is treated as 1.
    pub fn next_delay(&self, attempts: u16) -> Duration {
        let exponent = i32::from(attempts.saturating_sub(1));
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.max(self.base_delay);
        if secs.is_finite() && secs >= 0.0 && secs < cap.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            cap
        }
    }
}
