//! Bounded retry with capped exponential backoff.

use std::time::Duration;

use crate::error::IngestError;

/// How many attempts a unit gets and how long to wait between them.
///
/// After the `n`-th failed attempt the executor waits
/// `min(base · 2^n, max_delay)` plus up to `jitter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Clamped to at least 1.
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
    /// Upper bound of uniform random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// No waiting between attempts. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff without jitter after `failed_attempts` failures (1-indexed).
    ///
    /// With the defaults: 2s, 4s, 8s, then 10s.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus jitter; what the executor actually sleeps.
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let delay = self.backoff(failed_attempts);
        if self.jitter.is_zero() {
            return delay;
        }
        delay + Duration::from_millis(jitter_ms(self.jitter.as_millis() as u64))
    }
}

/// Per-unit retry bookkeeping, dropped once the unit finishes.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    pub last_error: Option<IngestError>,
    pub next_delay: Option<Duration>,
}

impl RetryState {
    /// Record a failed attempt. Returns the delay before the next attempt,
    /// or `None` when the error is not retryable or the budget is spent.
    pub fn on_failure(&mut self, policy: &RetryPolicy, error: IngestError) -> Option<Duration> {
        let retry = error.is_retryable() && self.attempt < policy.max_attempts;
        self.last_error = Some(error);
        self.next_delay = retry.then(|| policy.delay_for_attempt(self.attempt));
        self.next_delay
    }

    /// Turn the recorded failure into the error reported for the unit.
    pub fn into_error(self, policy: &RetryPolicy) -> IngestError {
        let last = self
            .last_error
            .unwrap_or_else(|| IngestError::Network("no attempt was made".into()));
        if last.is_retryable() && self.attempt >= policy.max_attempts {
            IngestError::RetriesExhausted {
                attempts: self.attempt,
                last: Box::new(last),
            }
        } else {
            last
        }
    }
}

/// Pseudo-random value in `[0, max_ms)` from an xorshift over the clock.
///
/// Good enough to spread retries and request timing; not for anything else.
pub fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
