//! Retry policy: exponential backoff with cap and jitter.

use std::time::Duration;

use rand::Rng;

use renderq_models::ErrorClass;

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration },
    /// Dead-letter the task.
    GiveUp,
}

/// Computes whether and when a failed task is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for attempt 1 (doubles per attempt)
    pub base: Duration,
    /// Upper bound on the delay before jitter
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Decide the fate of a failure with `retry_count` attempts already
    /// consumed out of `max_retries`.
    ///
    /// `Permanent` and `Cancelled` classes never retry. Retryable classes
    /// retry while budget remains; the delay for attempt `n` (1-indexed) is
    /// `min(cap, base * 2^(n-1))` scaled by a jitter factor drawn uniformly
    /// from `[0.8, 1.2]`.
    pub fn decide(
        &self,
        class: ErrorClass,
        retry_count: u32,
        max_retries: u32,
    ) -> RetryDecision {
        if !class.is_retryable() || retry_count >= max_retries {
            return RetryDecision::GiveUp;
        }

        let attempt = retry_count + 1;
        RetryDecision::Retry {
            delay: self.jittered_delay(attempt),
        }
    }

    /// Backoff for attempt `n` (1-indexed) before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter: f64 = rand::rng().random_range(0.8..=1.2);
        base.mul_f64(jitter)
    }
}
