use std::path::Path;
use std::time::Duration;

use docket_core::error::{ArtifactError, IngestError};
use docket_core::traits::ArtifactStore;
use reqwest::{Client, StatusCode};
use url::Url;

/// Object store reached over plain HTTP: `PUT`/`GET` on `<base>/<key>`.
///
/// Works with any bucket gateway that accepts bearer-token uploads. Listing
/// is not part of that contract, so [`list`](ArtifactStore::list) reports
/// [`ArtifactError::Unsupported`].
#[derive(Clone)]
pub struct HttpArtifactStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, IngestError> {
        Self::with_timeout(base_url, token, Duration::from_secs(300))
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        let base = Url::parse(base_url)
            .map_err(|e| IngestError::ConfigError(format!("invalid store URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(IngestError::ConfigError(format!(
                "store URL {base_url} cannot have paths"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(key.split('/'));
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn status_error(status: StatusCode, key: &str) -> ArtifactError {
    let detail = format!("{key}: HTTP {}", status.as_u16());
    match status.as_u16() {
        401 | 403 => ArtifactError::PermissionDenied(detail),
        404 => ArtifactError::NotFound(key.to_string()),
        413 | 507 => ArtifactError::QuotaExceeded(detail),
        408 | 429 | 500.. => ArtifactError::Unavailable(detail),
        _ => ArtifactError::PermissionDenied(detail),
    }
}

fn transport_error(e: reqwest::Error, key: &str) -> ArtifactError {
    ArtifactError::Unavailable(format!("{key}: {e}"))
}

impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ArtifactError> {
        let body = tokio::fs::read(local).await.map_err(|e| {
            ArtifactError::Unavailable(format!("cannot read {}: {e}", local.display()))
        })?;
        let size = body.len();

        let response = self
            .authorize(self.client.put(self.object_url(key)))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(e, key))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), key));
        }

        tracing::debug!(key, bytes = size, "Uploaded artifact");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let response = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(|e| transport_error(e, key))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), key));
        }
        let bytes = response.bytes().await.map_err(|e| transport_error(e, key))?;
        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        Err(ArtifactError::Unsupported(format!(
            "listing `{prefix}` over HTTP"
        )))
    }
}
