pub mod artifact;
pub mod checkpoint;
pub mod coordinator;
pub mod enumerate;
pub mod error;
pub mod executor;
pub mod poll;
pub mod processors;
pub mod reporter;
pub mod retry;
pub mod traits;
pub mod unit;

#[cfg(test)]
pub(crate) mod testutil;

pub use artifact::FsArtifactStore;
pub use checkpoint::{CheckpointRecord, CheckpointStore, StatusCounts, UnitStatus};
pub use coordinator::{Coordinator, RunConfig, RunSummary};
pub use error::{ArtifactError, ErrorKind, IngestError};
pub use executor::Executor;
pub use reporter::{RunEvent, RunReporter, TracingRunReporter};
pub use retry::RetryPolicy;
pub use traits::{ArtifactStore, Enumerator, Fetcher, Processor, Transformer};
pub use unit::{Artifact, FetchedDocument, Metadata, PageRange, WorkUnit};
