use std::time::Duration;

use crate::coordinator::RunSummary;
use crate::error::IngestError;

/// Why a candidate unit was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The checkpoint already holds a terminal status.
    AlreadyDone,
    /// The same unit id was dispatched earlier in this run.
    Repeated,
}

/// Events emitted by the coordinator and executor for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    RunStarted {
        run_id: &'a str,
    },
    UnitSkipped {
        unit_id: &'a str,
        reason: SkipReason,
    },
    UnitStarted {
        unit_id: &'a str,
        locator: &'a str,
    },
    UnitRetrying {
        unit_id: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a IngestError,
    },
    UnitSucceeded {
        unit_id: &'a str,
        artifact_key: Option<&'a str>,
        duplicate_of: Option<&'a str>,
    },
    UnitFailed {
        unit_id: &'a str,
        error: &'a str,
    },
    Cancelled {
        in_flight: usize,
    },
    RunFinished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::RunStarted { run_id } => {
                tracing::info!(%run_id, "Run started");
            }
            RunEvent::UnitSkipped { unit_id, reason } => {
                tracing::info!(%unit_id, ?reason, "Skipping unit");
            }
            RunEvent::UnitStarted { unit_id, locator } => {
                tracing::info!(%unit_id, %locator, "Processing unit");
            }
            RunEvent::UnitRetrying {
                unit_id,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    %unit_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Attempt failed, retrying"
                );
            }
            RunEvent::UnitSucceeded {
                unit_id,
                artifact_key,
                duplicate_of,
            } => {
                tracing::info!(%unit_id, ?artifact_key, ?duplicate_of, "Unit succeeded");
            }
            RunEvent::UnitFailed { unit_id, error } => {
                tracing::warn!(%unit_id, %error, "Unit failed");
            }
            RunEvent::Cancelled { in_flight } => {
                tracing::info!(in_flight, "Cancellation requested, draining in-flight units");
            }
            RunEvent::RunFinished { summary } => {
                tracing::info!(
                    run_id = %summary.run_id,
                    total = summary.total,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    duplicates = summary.duplicates,
                    cancelled = summary.cancelled,
                    "Run finished"
                );
            }
        }
    }
}
