use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docket_core::artifact::{safe_filename_from_url, sha256_hex, stage_bytes};
use docket_core::reporter::RunReporter;
use docket_core::{
    Artifact, CheckpointStore, Coordinator, Enumerator, Executor, FsArtifactStore, IngestError,
    Metadata, Processor, RetryPolicy, RunConfig, WorkUnit,
};
use futures::stream::{self, BoxStream, StreamExt};

/// Reporter that drops every event.
pub struct Quiet;

impl RunReporter for Quiet {}

/// Writes a small PDF per unit into a staging directory.
///
/// Units listed in `broken` fail permanently; units in `slow` sleep longer
/// than any attempt timeout used by the tests.
#[derive(Clone)]
pub struct StagingProcessor {
    dir: PathBuf,
    broken: Arc<HashSet<String>>,
    slow: Arc<HashSet<String>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl StagingProcessor {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            broken: Arc::default(),
            slow: Arc::default(),
            attempts: Arc::default(),
        }
    }

    pub fn broken(mut self, ids: &[&str]) -> Self {
        self.broken = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn slow(mut self, ids: &[&str]) -> Self {
        self.slow = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn attempts(&self, unit_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(unit_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }
}

impl Processor for StagingProcessor {
    async fn process(&self, unit: &WorkUnit) -> Result<Artifact, IngestError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(unit.unit_id.clone())
            .or_insert(0) += 1;

        if self.slow.contains(&unit.unit_id) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.broken.contains(&unit.unit_id) {
            return Err(IngestError::Http {
                status: 404,
                url: unit.source_locator.clone(),
            });
        }

        let body = format!("%PDF-1.7 {}", unit.unit_id).repeat(64).into_bytes();
        let path = stage_bytes(&self.dir, &safe_filename_from_url(&unit.source_locator), &body)?;
        Ok(Artifact {
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            local_path: path,
            source_key: unit.source_locator.clone(),
            size: body.len() as u64,
            sha256: sha256_hex(&body),
            metadata: Metadata::new(),
        })
    }
}

/// Yields a fixed list once.
pub struct ListEnumerator(Mutex<Vec<Result<WorkUnit, IngestError>>>);

impl ListEnumerator {
    pub fn new(items: Vec<Result<WorkUnit, IngestError>>) -> Self {
        Self(Mutex::new(items))
    }

    pub fn ids(ids: &[&str]) -> Self {
        Self::new(
            ids.iter()
                .map(|id| Ok(unit(id, &format!("https://filings.example.org/{id}.pdf"))))
                .collect(),
        )
    }
}

impl Enumerator for ListEnumerator {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        stream::iter(std::mem::take(&mut *self.0.lock().unwrap())).boxed()
    }
}

pub fn unit(id: &str, url: &str) -> WorkUnit {
    WorkUnit::new(url).with_id(id)
}

pub fn coordinator(
    processor: StagingProcessor,
    bucket: &Path,
    config: RunConfig,
) -> Coordinator<StagingProcessor, FsArtifactStore> {
    let executor = Executor::new(processor, RetryPolicy::immediate(3))
        .with_attempt_timeout(Duration::from_millis(100));
    Coordinator::new(executor, FsArtifactStore::new(bucket), config)
}

pub fn checkpoint(dir: &Path) -> CheckpointStore {
    CheckpointStore::open(dir.join("state").join("checkpoint.csv")).unwrap()
}
