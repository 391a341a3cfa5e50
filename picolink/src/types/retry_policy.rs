//! Retry policy for connect and association loops.

use std::time::Duration;

/// How long to wait between attempts, and whether to give up.
///
/// Attempts are numbered from 1. The delay before attempt `n + 1` is
/// `initial * multiplier^(n - 1)`, capped at `max_delay`. A fixed policy is
/// the special case where `initial == max_delay`.
///
/// With no attempt cap the policy retries forever, which is what an
/// unattended gateway wants for its uplink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with the same delay between attempts.
    ///
    /// # Panics
    /// Panics if `delay` is zero.
    pub const fn fixed(delay: Duration) -> Self {
        assert!(!delay.is_zero(), "retry delay must be non-zero");
        Self {
            initial: delay,
            max_delay: delay,
            multiplier: 1,
            max_attempts: None,
        }
    }

    /// Retry forever, doubling the delay up to `max_delay`.
    ///
    /// # Panics
    /// Panics if `initial` is zero or `max_delay` is below `initial`.
    pub fn exponential(initial: Duration, max_delay: Duration) -> Self {
        assert!(!initial.is_zero(), "retry delay must be non-zero");
        assert!(max_delay >= initial, "max delay below initial delay");
        Self {
            initial,
            max_delay,
            multiplier: 2,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` attempts. Zero is treated as one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Whether attempt number `attempt` (1-based) may be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    /// Fixed five-second delay, unbounded.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.initial == self.max_delay {
            write!(f, "every {:?}", self.initial)?;
        } else {
            write!(f, "backoff {:?}..{:?}", self.initial, self.max_delay)?;
        }
        match self.max_attempts {
            Some(n) => write!(f, ", at most {} attempts", n),
            None => write!(f, ", unbounded"),
        }
    }
}
