//! Built-in processors: PDF download and document transform.

use std::path::{Path, PathBuf};

use url::Url;

use crate::artifact::{
    base_name_from_key, persist_unique, safe_filename_from_url, sha256_hex, stage_temp,
};
use crate::error::IngestError;
use crate::traits::{ArtifactStore, Fetcher, Processor, Transformer};
use crate::unit::{Artifact, META_REFERRER, Metadata, WorkUnit};

/// Payloads smaller than this are error pages, not documents.
pub const DEFAULT_MIN_BYTES: u64 = 1024;

/// Write `bytes` to a temp file off the async runtime, then claim its final
/// name under `dir`.
///
/// The rename happens on the calling task, so an attempt dropped while the
/// write is still running leaves only a temp file, which is deleted.
async fn stage(dir: &Path, name: &str, bytes: Vec<u8>) -> Result<(PathBuf, String), IngestError> {
    let owned_dir = dir.to_path_buf();
    let staged = tokio::task::spawn_blocking(move || stage_temp(&owned_dir, &bytes))
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
    let path = persist_unique(staged, dir, name)?;
    let final_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((path, final_name))
}

fn path_is_pdf(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase().ends_with(".pdf"),
        Err(_) => url.to_ascii_lowercase().ends_with(".pdf"),
    }
}

/// Downloads `source_locator` and stages it as a PDF in `dest_dir`.
#[derive(Clone)]
pub struct DownloadProcessor<F> {
    fetcher: F,
    dest_dir: PathBuf,
    min_bytes: u64,
}

impl<F: Fetcher> DownloadProcessor<F> {
    pub fn new(fetcher: F, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            dest_dir: dest_dir.into(),
            min_bytes: DEFAULT_MIN_BYTES,
        }
    }

    pub fn with_min_bytes(mut self, min_bytes: u64) -> Self {
        self.min_bytes = min_bytes;
        self
    }
}

impl<F: Fetcher> Processor for DownloadProcessor<F> {
    async fn process(&self, unit: &WorkUnit) -> Result<Artifact, IngestError> {
        let url = unit.source_locator.as_str();
        let document = self.fetcher.fetch(url, unit.referrer()).await?;

        if !document.is_pdf() && !path_is_pdf(url) {
            return Err(IngestError::InvalidContent(format!(
                "expected a PDF from {url}, got {}",
                document.content_type.as_deref().unwrap_or("no content type")
            )));
        }
        let size = document.body.len() as u64;
        if size < self.min_bytes {
            return Err(IngestError::InvalidContent(format!(
                "{url} returned {size} bytes, below the {} byte minimum",
                self.min_bytes
            )));
        }

        let sha256 = sha256_hex(&document.body);
        let name = safe_filename_from_url(url);
        let (local_path, name) = stage(&self.dest_dir, &name, document.body).await?;

        let mut metadata: Metadata = unit.metadata.clone();
        metadata.insert("source_url".into(), url.to_string());
        if document.url != url {
            metadata.insert("final_url".into(), document.url.clone());
        }
        if let Some(referrer) = unit.referrer() {
            metadata.insert(META_REFERRER.into(), referrer.to_string());
        }

        tracing::debug!(unit_id = %unit.unit_id, file = %name, size, "Downloaded PDF");
        Ok(Artifact {
            name,
            local_path,
            source_key: url.to_string(),
            size,
            sha256,
            metadata,
        })
    }
}

/// Reads a source object, runs it through a [`Transformer`], and stages the
/// JSON result as `<base>.json`. URL locators skip the source store.
#[derive(Clone)]
pub struct TransformProcessor<S, T> {
    source: S,
    transformer: T,
    dest_dir: PathBuf,
}

impl<S: ArtifactStore, T: Transformer> TransformProcessor<S, T> {
    pub fn new(source: S, transformer: T, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            transformer,
            dest_dir: dest_dir.into(),
        }
    }
}

/// Locators with an http(s) scheme are handed to the transformer as URLs
/// instead of being read from the source store.
fn is_remote(locator: &str) -> bool {
    Url::parse(locator).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

impl<S: ArtifactStore, T: Transformer> Processor for TransformProcessor<S, T> {
    async fn process(&self, unit: &WorkUnit) -> Result<Artifact, IngestError> {
        let key = unit.source_locator.as_str();
        let (output, base_name) = if is_remote(key) {
            let output = self.transformer.transform_url(key).await?;
            (output, base_name_from_key(&safe_filename_from_url(key)).to_string())
        } else {
            let bytes = self.source.get(key).await?;
            let file_name = key.rsplit('/').next().unwrap_or(key);
            let output = self.transformer.transform(file_name, bytes).await?;
            (output, base_name_from_key(key).to_string())
        };

        let value: serde_json::Value = serde_json::from_str(&output)
            .map_err(|e| IngestError::Parse(format!("transform output for {key}: {e}")))?;
        if !value.is_object() {
            return Err(IngestError::Parse(format!(
                "transform output for {key} is not a JSON object"
            )));
        }

        let pretty = serde_json::to_vec_pretty(&value)?;
        let size = pretty.len() as u64;
        let sha256 = sha256_hex(&pretty);
        let name = format!("{base_name}.json");
        let (local_path, name) = stage(&self.dest_dir, &name, pretty).await?;

        let mut metadata = unit.metadata.clone();
        let source_field = if is_remote(key) { "source_url" } else { "source_key" };
        metadata.insert(source_field.into(), key.to_string());

        Ok(Artifact {
            name,
            local_path,
            source_key: key.to_string(),
            size,
            sha256,
            metadata,
        })
    }
}
