//! Bounded polling for remote jobs that finish asynchronously.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between checks.
    pub interval: Duration,
    /// Overall deadline measured from the first check.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready(T),
    /// The check failed; the caller decides whether the unit is retried.
    TransientError(IngestError),
    TimedOut,
}

impl<T> PollOutcome<T> {
    /// Collapse into a `Result`, turning a timeout into [`IngestError::Timeout`].
    pub fn into_result(self, config: &PollConfig) -> Result<T, IngestError> {
        match self {
            PollOutcome::Ready(value) => Ok(value),
            PollOutcome::TransientError(e) => Err(e),
            PollOutcome::TimedOut => Err(IngestError::Timeout(config.timeout.as_secs())),
        }
    }
}

/// Call `check` every `interval` until it yields a value, fails, or the
/// deadline passes. `Ok(None)` means "not ready yet".
pub async fn poll_until<T, F, Fut>(config: PollConfig, mut check: F) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, IngestError>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut checks = 0u32;
    loop {
        checks += 1;
        match tokio::time::timeout_at(deadline, check()).await {
            Err(_) => break,
            Ok(Ok(Some(value))) => return PollOutcome::Ready(value),
            Ok(Err(e)) => return PollOutcome::TransientError(e),
            Ok(Ok(None)) => {}
        }
        if Instant::now() + config.interval >= deadline {
            break;
        }
        tokio::time::sleep(config.interval).await;
    }
    tracing::debug!(checks, timeout_s = config.timeout.as_secs(), "Poll timed out");
    PollOutcome::TimedOut
}
