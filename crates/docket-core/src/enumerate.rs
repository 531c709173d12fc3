//! Built-in work-unit enumerators.

use std::collections::BTreeMap;
use std::path::PathBuf;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;

use crate::error::IngestError;
use crate::traits::{ArtifactStore, Enumerator};
use crate::unit::{Metadata, PageRange, WorkUnit, expand_template};

/// One unit per page number, with the locator built from a `{n}` template.
#[derive(Debug, Clone)]
pub struct RangeEnumerator {
    range: PageRange,
    template: String,
}

impl RangeEnumerator {
    pub fn new(range: PageRange, template: impl Into<String>) -> Self {
        Self {
            range,
            template: template.into(),
        }
    }
}

impl Enumerator for RangeEnumerator {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        let template = self.template.clone();
        stream::iter(self.range.iter())
            .map(move |n| {
                Ok(WorkUnit::new(expand_template(&template, n)).with_meta("page", n.to_string()))
            })
            .boxed()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Url(String),
    Entry {
        #[serde(default)]
        unit_id: Option<String>,
        url: String,
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
}

impl ManifestEntry {
    /// `None` for entries whose URL is blank.
    fn into_unit(self) -> Option<WorkUnit> {
        match self {
            ManifestEntry::Url(url) => non_blank(&url).map(WorkUnit::new),
            ManifestEntry::Entry {
                unit_id,
                url,
                extra,
            } => {
                let mut unit = WorkUnit::new(non_blank(&url)?);
                if let Some(id) = unit_id.as_deref().and_then(non_blank) {
                    unit.unit_id = id.to_string();
                }
                unit.metadata = extra
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect();
                Some(unit)
            }
        }
    }
}

fn non_blank(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

/// Units listed in a manifest file.
///
/// `.csv` manifests need a `url` column; an optional `unit_id` column
/// overrides the identity and every other column becomes metadata. Anything
/// else is read as a JSON array of URL strings or `{url, ...}` objects.
#[derive(Debug, Clone)]
pub struct ManifestEnumerator {
    path: PathBuf,
}

impl ManifestEnumerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn is_csv(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
    }

    async fn load(&self) -> Result<Vec<WorkUnit>, IngestError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            IngestError::Enumeration(format!("cannot read manifest {}: {e}", self.path.display()))
        })?;
        let units = if self.is_csv() {
            parse_csv_manifest(&data)
        } else {
            serde_json::from_slice::<Vec<ManifestEntry>>(&data)
                .map(|entries| entries.into_iter().filter_map(ManifestEntry::into_unit).collect())
                .map_err(|e| e.to_string())
        }
        .map_err(|e| {
            IngestError::Enumeration(format!("invalid manifest {}: {e}", self.path.display()))
        })?;

        tracing::info!(path = %self.path.display(), units = units.len(), "Manifest loaded");
        Ok(units)
    }
}

fn parse_csv_manifest(data: &[u8]) -> Result<Vec<WorkUnit>, String> {
    let mut reader = csv::Reader::from_reader(data);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let url_col = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("url"))
        .ok_or("missing `url` column")?;
    let id_col = headers.iter().position(|h| h.eq_ignore_ascii_case("unit_id"));

    let mut units = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("row {}: {e}", row + 1))?;
        let url = record.get(url_col).unwrap_or_default().trim();
        if url.is_empty() {
            continue;
        }
        let mut unit = WorkUnit::new(url);
        if let Some(id) = id_col.and_then(|c| record.get(c)).and_then(non_blank) {
            unit.unit_id = id.to_string();
        }
        let metadata: Metadata = headers
            .iter()
            .zip(record.iter())
            .enumerate()
            .filter(|(i, (_, value))| *i != url_col && Some(*i) != id_col && !value.is_empty())
            .map(|(_, (key, value))| (key.to_string(), value.to_string()))
            .collect();
        unit.metadata = metadata;
        units.push(unit);
    }
    Ok(units)
}

impl Enumerator for ManifestEnumerator {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        stream::once(self.load())
            .map_ok(|units| stream::iter(units.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

/// Keys under `prefix` in an [`ArtifactStore`] whose name ends with `suffix`
/// (case-insensitive). Each key is both the unit id and the locator.
#[derive(Debug, Clone)]
pub struct StoreEnumerator<S> {
    store: S,
    prefix: String,
    suffix: String,
}

impl<S: ArtifactStore> StoreEnumerator<S> {
    pub fn new(store: S, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            suffix: suffix.into().to_ascii_lowercase(),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, IngestError> {
        let keys = self.store.list(&self.prefix).await.map_err(|e| {
            IngestError::Enumeration(format!("cannot list `{}`: {e}", self.prefix))
        })?;
        let total = keys.len();
        let keys: Vec<_> = keys
            .into_iter()
            .filter(|k| k.to_ascii_lowercase().ends_with(&self.suffix))
            .collect();
        tracing::info!(prefix = %self.prefix, total, matching = keys.len(), "Listed source keys");
        Ok(keys)
    }
}

impl<S: ArtifactStore> Enumerator for StoreEnumerator<S> {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        stream::once(self.keys())
            .map_ok(|keys| stream::iter(keys.into_iter().map(|k| Ok(WorkUnit::new(k)))))
            .try_flatten()
            .boxed()
    }
}
