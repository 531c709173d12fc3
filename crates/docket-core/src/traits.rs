use std::future::Future;
use std::path::Path;

use futures::stream::BoxStream;

use crate::error::{ArtifactError, IngestError};
use crate::unit::{Artifact, FetchedDocument, WorkUnit};

/// Produces the work units for one run.
///
/// The stream is lazy, finite and consumed once. It performs no checkpoint
/// filtering; an `Err` item aborts the run.
pub trait Enumerator: Send + Sync {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>>;
}

/// Fetches a remote document over HTTP (or a browser).
pub trait Fetcher: Send + Sync + Clone {
    /// `referer` is sent as the `Referer` header when present.
    fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> impl Future<Output = Result<FetchedDocument, IngestError>> + Send;
}

/// Performs a single attempt of one unit's work, staging the result locally.
///
/// Implementations must not leave a partial local file behind when they
/// return an error or are dropped mid-attempt.
pub trait Processor: Send + Sync + Clone {
    fn process(&self, unit: &WorkUnit)
    -> impl Future<Output = Result<Artifact, IngestError>> + Send;
}

/// The OCR/extraction boundary: document bytes in, JSON text out.
pub trait Transformer: Send + Sync + Clone {
    fn transform(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<String, IngestError>> + Send;

    /// Transform a document the backing service fetches itself from `url`.
    fn transform_url(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<String, IngestError>> + Send {
        let err = IngestError::InvalidContent(format!("{url}: remote documents are not supported"));
        async move { Err(err) }
    }
}

/// Durable key-value storage for artifacts. Keys are `prefix/filename`.
pub trait ArtifactStore: Send + Sync + Clone {
    /// Upload the file at `local` under `key`, overwriting any previous object.
    fn put(
        &self,
        local: &Path,
        key: &str,
    ) -> impl Future<Output = Result<(), ArtifactError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, ArtifactError>> + Send;

    /// All keys starting with `prefix`, in lexical order.
    fn list(&self, prefix: &str)
    -> impl Future<Output = Result<Vec<String>, ArtifactError>> + Send;
}
