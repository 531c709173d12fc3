//! Runs one unit through a [`Processor`] under the retry policy.

use std::time::Duration;

use crate::error::IngestError;
use crate::reporter::{RunEvent, RunReporter};
use crate::retry::{RetryPolicy, RetryState};
use crate::traits::Processor;
use crate::unit::{Artifact, WorkUnit};

/// Default deadline for a single attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct Executor<P> {
    processor: P,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<P: Processor> Executor<P> {
    pub fn new(processor: P, policy: RetryPolicy) -> Self {
        Self {
            processor,
            policy,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `unit`, retrying transient failures.
    ///
    /// Returns the staged artifact, the first permanent error, or
    /// [`IngestError::RetriesExhausted`] once the attempt budget is spent.
    /// An attempt that overruns its deadline is dropped and counts as a
    /// transient timeout. The built-in processors only name a staged file
    /// after the write completes on the attempt's own task, so a dropped
    /// attempt leaves nothing behind.
    pub async fn execute<R: RunReporter>(
        &self,
        unit: &WorkUnit,
        reporter: &R,
    ) -> Result<Artifact, IngestError> {
        let mut state = RetryState::default();
        loop {
            state.attempt += 1;
            let outcome =
                match tokio::time::timeout(self.attempt_timeout, self.processor.process(unit))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(IngestError::Timeout(self.attempt_timeout.as_secs())),
                };

            let error = match outcome {
                Ok(artifact) => return Ok(artifact),
                Err(e) => e,
            };

            match state.on_failure(&self.policy, error) {
                Some(delay) => {
                    if let Some(last) = state.last_error.as_ref() {
                        reporter.report(RunEvent::UnitRetrying {
                            unit_id: &unit.unit_id,
                            attempt: state.attempt,
                            delay,
                            error: last,
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
                None => return Err(state.into_error(&self.policy)),
            }
        }
    }
}
