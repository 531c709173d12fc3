//! Test utilities: mock implementations of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};

use crate::artifact::{sha256_hex, stage_bytes};
use crate::error::{ArtifactError, IngestError};
use crate::reporter::{RunEvent, RunReporter};
use crate::traits::{ArtifactStore, Enumerator, Fetcher, Processor, Transformer};
use crate::unit::{Artifact, FetchedDocument, Metadata, WorkUnit};

pub fn sample_artifact(unit_id: &str) -> Artifact {
    Artifact {
        name: format!("{unit_id}.pdf"),
        local_path: PathBuf::from(format!("/nonexistent/{unit_id}.pdf")),
        source_key: unit_id.to_string(),
        size: 2048,
        sha256: sha256_hex(unit_id.as_bytes()),
        metadata: Metadata::new(),
    }
}

pub fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(len.max(bytes.len()), b'x');
    bytes
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that pops queued responses and records every call.
#[derive(Clone, Default)]
pub struct MockFetcher {
    /// If empty, returns a 2 KiB PDF.
    responses: Arc<Mutex<Vec<Result<FetchedDocument, IngestError>>>>,
    calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<FetchedDocument, IngestError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    pub fn document(url: &str, content_type: &str, body: &[u8]) -> FetchedDocument {
        FetchedDocument {
            url: url.to_string(),
            content_type: Some(content_type.to_string()),
            body: body.to_vec(),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedDocument, IngestError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), referer.map(str::to_string)));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(Self::document(url, "application/pdf", &pdf_bytes(2048)))
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockProcessor
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> IngestError + Send + Sync>;

/// Processor with per-unit scripted outcomes and attempt counters.
///
/// Units without a script succeed with `<unit_id>.pdf`. With
/// [`staging_in`](Self::staging_in) the artifact is written to disk.
#[derive(Clone, Default)]
pub struct MockProcessor {
    scripts: Arc<Mutex<HashMap<String, Vec<Result<Artifact, IngestError>>>>>,
    always_fail: Arc<Mutex<HashMap<String, ErrorFactory>>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    names: Arc<Mutex<HashMap<String, String>>>,
    latency: Option<Duration>,
    stage_dir: Option<PathBuf>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, unit_id: &str, outcomes: Vec<Result<Artifact, IngestError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), outcomes);
        self
    }

    pub fn always_fail(
        self,
        unit_id: &str,
        error: impl Fn() -> IngestError + Send + Sync + 'static,
    ) -> Self {
        self.always_fail
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), Arc::new(error));
        self
    }

    /// Produce `name` instead of `<unit_id>.pdf` for this unit.
    pub fn naming(self, unit_id: &str, name: &str) -> Self {
        self.names
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), name.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn staging_in(mut self, dir: &Path) -> Self {
        self.stage_dir = Some(dir.to_path_buf());
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

impl Processor for MockProcessor {
    async fn process(&self, unit: &WorkUnit) -> Result<Artifact, IngestError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(unit.unit_id.clone())
            .or_insert(0) += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(factory) = self.always_fail.lock().unwrap().get(&unit.unit_id) {
            return Err(factory());
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&unit.unit_id)
            .filter(|s| !s.is_empty())
            .map(|s| s.remove(0));
        if let Some(outcome) = scripted {
            return outcome;
        }

        let mut artifact = sample_artifact(&unit.unit_id);
        if let Some(name) = self.names.lock().unwrap().get(&unit.unit_id) {
            artifact.name = name.clone();
        }
        if let Some(dir) = &self.stage_dir {
            let path = stage_bytes(dir, &artifact.name, &pdf_bytes(2048))?;
            artifact.name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            artifact.local_path = path;
        }
        Ok(artifact)
    }
}

// ---------------------------------------------------------------------------
// MockTransformer
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockTransformer {
    /// If empty, returns `{"pages": []}`.
    responses: Arc<Mutex<Vec<Result<String, IngestError>>>>,
    names: Arc<Mutex<Vec<String>>>,
}

impl MockTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<String, IngestError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

impl Transformer for MockTransformer {
    async fn transform(&self, name: &str, _bytes: Vec<u8>) -> Result<String, IngestError> {
        self.names.lock().unwrap().push(name.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(r#"{"pages": []}"#.to_string())
        } else {
            responses.remove(0)
        }
    }

    async fn transform_url(&self, url: &str) -> Result<String, IngestError> {
        self.transform(url, Vec::new()).await
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory store. Queued `put_errors` are returned by the next puts.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    put_errors: Arc<Mutex<Vec<ArtifactError>>>,
    puts: Arc<Mutex<Vec<String>>>,
    list_error: Arc<Mutex<Option<ArtifactError>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, key: &str, bytes: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        self
    }

    pub fn fail_puts(self, errors: Vec<ArtifactError>) -> Self {
        *self.put_errors.lock().unwrap() = errors;
        self
    }

    pub fn fail_list(self, error: ArtifactError) -> Self {
        *self.list_error.lock().unwrap() = Some(error);
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Every key passed to `put`, including repeats and failures.
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ArtifactError> {
        self.puts.lock().unwrap().push(key.to_string());
        {
            let mut errors = self.put_errors.lock().unwrap();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let bytes = tokio::fs::read(local).await.unwrap_or_default();
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        if let Some(e) = self.list_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// VecEnumerator
// ---------------------------------------------------------------------------

/// Enumerator over a fixed list; yields nothing after the first run.
pub struct VecEnumerator {
    items: Mutex<Vec<Result<WorkUnit, IngestError>>>,
}

impl VecEnumerator {
    pub fn new(items: Vec<Result<WorkUnit, IngestError>>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn from_ids(ids: &[&str]) -> Self {
        Self::new(
            ids.iter()
                .map(|id| Ok(WorkUnit::new(format!("https://example.org/{id}.pdf")).with_id(*id)))
                .collect(),
        )
    }
}

impl Enumerator for VecEnumerator {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        let items = std::mem::take(&mut *self.items.lock().unwrap());
        stream::iter(items).boxed()
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label per event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn retries(&self) -> usize {
        self.count("retrying")
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(label))
            .count()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match event {
            RunEvent::RunStarted { .. } => "started".to_string(),
            RunEvent::UnitSkipped { unit_id, .. } => format!("skipped:{unit_id}"),
            RunEvent::UnitStarted { unit_id, .. } => format!("executing:{unit_id}"),
            RunEvent::UnitRetrying { unit_id, attempt, .. } => {
                format!("retrying:{unit_id}:{attempt}")
            }
            RunEvent::UnitSucceeded { unit_id, .. } => format!("succeeded:{unit_id}"),
            RunEvent::UnitFailed { unit_id, .. } => format!("failed:{unit_id}"),
            RunEvent::Cancelled { .. } => "cancelled".to_string(),
            RunEvent::RunFinished { .. } => "finished".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}
