use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Free-form string metadata carried by units, artifacts and checkpoint records.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key for the page that referenced a unit.
pub const META_REFERRER: &str = "referrer";
/// Metadata key recording which earlier artifact a duplicate resolved to.
pub const META_DUPLICATE_OF: &str = "duplicate_of";
/// Metadata key for an artifact kept on local disk instead of uploaded.
pub const META_LOCAL_PATH: &str = "local_path";

/// One independently processable item: a page, a document, a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Stable identity used for checkpointing.
    pub unit_id: String,
    /// Where the payload lives (URL, object key, page URL).
    pub source_locator: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl WorkUnit {
    /// A unit whose identity is its locator.
    pub fn new(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        Self {
            unit_id: locator.clone(),
            source_locator: locator,
            metadata: Metadata::new(),
        }
    }

    pub fn with_id(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = unit_id.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn referrer(&self) -> Option<&str> {
        self.metadata.get(META_REFERRER).map(String::as_str)
    }
}

/// A payload staged on local disk by a processor, awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Final local file name; the deduplication key within a run.
    pub name: String,
    pub local_path: PathBuf,
    /// Where the payload came from (URL or source object key).
    pub source_key: String,
    pub size: u64,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    /// Produced metadata, copied into the checkpoint record.
    pub metadata: Metadata,
}

/// Response body returned by a [`Fetcher`](crate::traits::Fetcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedDocument {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the server declared this body as a PDF.
    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("pdf"))
    }
}

/// Inclusive page range that may run in either direction.
///
/// Regulator listings are usually walked newest-first, so `from > to`
/// yields a descending sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub from: i64,
    pub to: i64,
}

impl PageRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = i64> + Send> {
        if self.from <= self.to {
            Box::new(self.from..=self.to)
        } else {
            Box::new((self.to..=self.from).rev())
        }
    }
}

/// Substitute every `{n}` in `template` with `n`.
pub fn expand_template(template: &str, n: i64) -> String {
    template.replace("{n}", &n.to_string())
}
