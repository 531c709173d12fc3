use thiserror::Error;

/// How an error affects the unit and the run it occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry-eligible within the executor's attempt budget.
    Transient,
    /// Fatal for the unit only; recorded and the run continues.
    Permanent,
    /// The checkpoint log cannot be read or written.
    StoreCorrupt,
    /// The run cannot continue (no work units can be produced).
    Fatal,
}

/// Failures reported by an [`ArtifactStore`](crate::artifact::ArtifactStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("artifact store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("unsupported by this store: {0}")]
    Unsupported(String),
}

impl ArtifactError {
    pub(crate) fn from_io(key: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound => ArtifactError::NotFound(key.to_string()),
            Io::PermissionDenied | Io::ReadOnlyFilesystem => {
                ArtifactError::PermissionDenied(format!("{key}: {err}"))
            }
            Io::StorageFull | Io::FileTooLarge => {
                ArtifactError::QuotaExceeded(format!("{key}: {err}"))
            }
            _ => ArtifactError::Unavailable(format!("{key}: {err}")),
        }
    }
}

/// Pipeline-wide error type for Docket.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Non-success HTTP status from a fetch.
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// Connection refused/reset, DNS failure, truncated body.
    #[error("Network error: {0}")]
    Network(String),

    /// An attempt exceeded its deadline.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// `429` or quota response from a remote service.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Payload failed validation (content type, size).
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// Transform output could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The OCR/extraction service rejected or failed the request.
    #[error("Transform error (HTTP {status_code}): {message}")]
    Transform {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Local filesystem failure while staging an artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient failures outlasted the attempt budget.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<IngestError>,
    },

    #[error("Checkpoint store corrupt: {0}")]
    StoreCorrupt(String),

    /// The enumerator could not list work units.
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl IngestError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Network(_) | IngestError::Timeout(_) | IngestError::RateLimitExceeded => {
                true
            }
            IngestError::Http { status, .. } => *status == 408 || *status >= 500,
            IngestError::Transform { retryable, .. } => *retryable,
            IngestError::Artifact(ArtifactError::Unavailable(_)) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::StoreCorrupt(_) => ErrorKind::StoreCorrupt,
            IngestError::Enumeration(_) | IngestError::ConfigError(_) => ErrorKind::Fatal,
            e if e.is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    /// Whether this error must abort the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::StoreCorrupt | ErrorKind::Fatal)
    }
}
