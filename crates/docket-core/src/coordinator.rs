//! Drives a run: enumerate → checkpoint filter → execute → store → record.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::{load_staged, object_key};
use crate::checkpoint::{CheckpointStore, UnitStatus};
use crate::error::IngestError;
use crate::executor::Executor;
use crate::reporter::{RunEvent, RunReporter, SkipReason};
use crate::traits::{ArtifactStore, Enumerator, Processor};
use crate::unit::{Artifact, META_DUPLICATE_OF, META_LOCAL_PATH, Metadata, WorkUnit};

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Units executing at once.
    pub workers: usize,
    /// Stop dispatching after this many executed units. Skips do not count.
    pub limit: Option<usize>,
    /// Upload artifacts and delete the local copy afterwards.
    pub upload: bool,
    pub upload_prefix: String,
    pub put_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            limit: None,
            upload: true,
            upload_prefix: String::new(),
            put_timeout: Duration::from_secs(300),
        }
    }
}

impl RunConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_upload(mut self, upload: bool) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_upload_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.upload_prefix = prefix.into();
        self
    }

    pub fn with_put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Candidates received from the enumerator.
    pub total: usize,
    /// Includes duplicates.
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    /// Dispatch stopped early because the run was cancelled.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Succeeded { duplicate: bool },
    Failed,
}

/// What happened to a produced artifact after execution.
struct Settled {
    metadata: Metadata,
    artifact_key: Option<String>,
    duplicate_of: Option<String>,
}

async fn append(
    checkpoint: &CheckpointStore,
    unit_id: &str,
    status: UnitStatus,
    error_message: Option<String>,
    metadata: Metadata,
) -> Result<(), IngestError> {
    let store = checkpoint.clone();
    let unit_id = unit_id.to_string();
    tokio::task::spawn_blocking(move || {
        store.record(&unit_id, status, error_message.as_deref(), metadata)
    })
    .await
    .map_err(|e| IngestError::StoreCorrupt(format!("checkpoint append did not complete: {e}")))??;
    Ok(())
}

fn remove_local(unit_id: &str, artifact: &Artifact) {
    if let Err(e) = std::fs::remove_file(&artifact.local_path) {
        tracing::warn!(
            %unit_id,
            path = %artifact.local_path.display(),
            error = %e,
            "Failed to remove local artifact"
        );
    }
}

/// Pipeline coordinator shared by the crawl and OCR stages.
pub struct Coordinator<P, S> {
    executor: Executor<P>,
    store: S,
    config: RunConfig,
}

impl<P, S> Coordinator<P, S>
where
    P: Processor,
    S: ArtifactStore,
{
    pub fn new(executor: Executor<P>, store: S, config: RunConfig) -> Self {
        Self {
            executor,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Process every unit the enumerator yields that the checkpoint does not
    /// already mark as done.
    ///
    /// Unit failures are recorded and never abort the run. An enumerator
    /// error or a checkpoint write failure stops dispatch, lets in-flight
    /// units finish, and is returned as the run's error. Cancelling `cancel`
    /// stops dispatch the same way but still returns the summary.
    pub async fn run<E, R>(
        &self,
        enumerator: &E,
        checkpoint: &CheckpointStore,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<RunSummary, IngestError>
    where
        E: Enumerator + ?Sized,
        R: RunReporter,
    {
        let mut summary = RunSummary {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };
        reporter.report(RunEvent::RunStarted {
            run_id: &summary.run_id,
        });

        // Final local name → unit id that first produced it.
        let seen_names: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut units = enumerator.enumerate();
        let mut in_flight = FuturesUnordered::new();

        let mut executed = 0usize;
        let mut exhausted = false;
        let mut fatal: Option<IngestError> = None;

        loop {
            let can_dispatch = !exhausted
                && fatal.is_none()
                && !summary.cancelled
                && in_flight.len() < self.config.workers.max(1)
                && self.config.limit.is_none_or(|limit| executed < limit);
            if !can_dispatch && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                () = cancel.cancelled(), if !summary.cancelled => {
                    summary.cancelled = true;
                    reporter.report(RunEvent::Cancelled { in_flight: in_flight.len() });
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(UnitOutcome::Succeeded { duplicate }) => {
                            summary.succeeded += 1;
                            summary.duplicates += usize::from(duplicate);
                        }
                        Ok(UnitOutcome::Failed) => summary.failed += 1,
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "Checkpoint write failed, stopping dispatch"
                            );
                            fatal.get_or_insert(e);
                        }
                    }
                }
                next = units.next(), if can_dispatch => match next {
                    None => exhausted = true,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Enumeration failed, stopping dispatch");
                        fatal = Some(if e.is_fatal() {
                            e
                        } else {
                            IngestError::Enumeration(e.to_string())
                        });
                    }
                    Some(Ok(unit)) => {
                        summary.total += 1;
                        if checkpoint.is_done(&unit.unit_id) {
                            summary.skipped += 1;
                            reporter.report(RunEvent::UnitSkipped {
                                unit_id: &unit.unit_id,
                                reason: SkipReason::AlreadyDone,
                            });
                        } else if !dispatched.insert(unit.unit_id.clone()) {
                            summary.skipped += 1;
                            reporter.report(RunEvent::UnitSkipped {
                                unit_id: &unit.unit_id,
                                reason: SkipReason::Repeated,
                            });
                        } else {
                            executed += 1;
                            in_flight.push(
                                self.process_unit(unit, checkpoint, &seen_names, reporter),
                            );
                        }
                    }
                },
                else => break,
            }
        }

        reporter.report(RunEvent::RunFinished { summary: &summary });
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Execute one unit and record its outcome. Only checkpoint failures are
    /// returned as errors.
    async fn process_unit<R: RunReporter>(
        &self,
        unit: WorkUnit,
        checkpoint: &CheckpointStore,
        seen_names: &Mutex<HashMap<String, String>>,
        reporter: &R,
    ) -> Result<UnitOutcome, IngestError> {
        reporter.report(RunEvent::UnitStarted {
            unit_id: &unit.unit_id,
            locator: &unit.source_locator,
        });

        let produced = match self.kept_artifact(&unit, checkpoint).await {
            Some(artifact) => Ok(artifact),
            None => self.executor.execute(&unit, reporter).await,
        };
        let settled = match produced {
            Ok(artifact) => self.settle(&unit, artifact, seen_names).await,
            Err(e) => Err((e, unit.metadata.clone())),
        };

        match settled {
            Ok(settled) => {
                append(
                    checkpoint,
                    &unit.unit_id,
                    UnitStatus::Success,
                    None,
                    settled.metadata,
                )
                .await?;
                reporter.report(RunEvent::UnitSucceeded {
                    unit_id: &unit.unit_id,
                    artifact_key: settled.artifact_key.as_deref(),
                    duplicate_of: settled.duplicate_of.as_deref(),
                });
                Ok(UnitOutcome::Succeeded {
                    duplicate: settled.duplicate_of.is_some(),
                })
            }
            Err((error, metadata)) => {
                let message = error.to_string();
                append(
                    checkpoint,
                    &unit.unit_id,
                    UnitStatus::Failed,
                    Some(message.clone()),
                    metadata,
                )
                .await?;
                reporter.report(RunEvent::UnitFailed {
                    unit_id: &unit.unit_id,
                    error: &message,
                });
                Ok(UnitOutcome::Failed)
            }
        }
    }

    /// The file a reset unit left on disk when its upload failed.
    ///
    /// Returns `None` (and the unit is processed from scratch) when the
    /// record has no `local_path` or the file is gone.
    async fn kept_artifact(
        &self,
        unit: &WorkUnit,
        checkpoint: &CheckpointStore,
    ) -> Option<Artifact> {
        let record = checkpoint
            .get(&unit.unit_id)
            .filter(|r| r.status == UnitStatus::Pending)?;
        let path = PathBuf::from(record.metadata.get(META_LOCAL_PATH)?);

        let mut metadata = record.metadata;
        for key in [META_LOCAL_PATH, "file_name", "bytes", "sha256", "artifact_key"] {
            metadata.remove(key);
        }
        let source_key = metadata
            .get("source_url")
            .or_else(|| metadata.get("source_key"))
            .cloned()
            .unwrap_or_else(|| unit.source_locator.clone());

        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || load_staged(path, source_key, metadata)).await {
            Ok(Ok(artifact)) => {
                tracing::info!(
                    unit_id = %unit.unit_id,
                    path = %shown,
                    "Reusing kept local artifact"
                );
                Some(artifact)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    unit_id = %unit.unit_id,
                    path = %shown,
                    error = %e,
                    "Kept local artifact unreadable, processing again"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    unit_id = %unit.unit_id,
                    error = %e,
                    "Kept artifact check did not complete"
                );
                None
            }
        }
    }

    /// Deduplicate, upload, and clean up a produced artifact.
    async fn settle(
        &self,
        unit: &WorkUnit,
        artifact: Artifact,
        seen_names: &Mutex<HashMap<String, String>>,
    ) -> Result<Settled, (IngestError, Metadata)> {
        let mut metadata = artifact.metadata.clone();
        metadata.insert("file_name".into(), artifact.name.clone());
        metadata.insert("bytes".into(), artifact.size.to_string());
        metadata.insert("sha256".into(), artifact.sha256.clone());

        let first = {
            let mut seen = seen_names.lock().unwrap_or_else(|p| p.into_inner());
            match seen.get(&artifact.name) {
                Some(first) => Some(first.clone()),
                None => {
                    seen.insert(artifact.name.clone(), unit.unit_id.clone());
                    None
                }
            }
        };
        if let Some(first) = first {
            tracing::info!(
                unit_id = %unit.unit_id,
                file = %artifact.name,
                duplicate_of = %first,
                "Duplicate artifact discarded"
            );
            remove_local(&unit.unit_id, &artifact);
            metadata.insert(META_DUPLICATE_OF.into(), first.clone());
            return Ok(Settled {
                metadata,
                artifact_key: None,
                duplicate_of: Some(first),
            });
        }

        if !self.config.upload {
            metadata.insert(
                META_LOCAL_PATH.into(),
                artifact.local_path.display().to_string(),
            );
            return Ok(Settled {
                metadata,
                artifact_key: None,
                duplicate_of: None,
            });
        }

        let key = object_key(&self.config.upload_prefix, &artifact.name);
        let put = tokio::time::timeout(
            self.config.put_timeout,
            self.store.put(&artifact.local_path, &key),
        )
        .await;
        let error = match put {
            Ok(Ok(())) => {
                remove_local(&unit.unit_id, &artifact);
                metadata.insert("artifact_key".into(), key.clone());
                return Ok(Settled {
                    metadata,
                    artifact_key: Some(key),
                    duplicate_of: None,
                });
            }
            Ok(Err(e)) => IngestError::from(e),
            Err(_) => IngestError::Timeout(self.config.put_timeout.as_secs()),
        };

        // The local copy stays for a later run; free the name so that run
        // is not treated as a duplicate of this one.
        seen_names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&artifact.name);
        metadata.insert(
            META_LOCAL_PATH.into(),
            artifact.local_path.display().to_string(),
        );
        Err((error, metadata))
    }
}
