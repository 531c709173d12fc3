use std::time::Duration;

use docket_core::error::IngestError;
use docket_core::traits::Fetcher;
use docket_core::unit::FetchedDocument;
use reqwest::header::{ACCEPT, CONTENT_TYPE, REFERER};
use reqwest::{Client, StatusCode};

/// Browser-like User-Agent; several regulator sites refuse obvious bots.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const DEFAULT_ACCEPT: &str = "application/pdf,text/html;q=0.9,*/*;q=0.8";

/// HTTP fetcher using reqwest.
///
/// Sends a browser-like User-Agent, an `Accept` header preferring PDFs, and
/// the unit's referrer when one is known.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, IngestError> {
        Self::with_timeout(Duration::from_secs(60))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, IngestError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

/// Map a reqwest transport error onto the ingest taxonomy.
pub(crate) fn classify(e: &reqwest::Error, timeout_secs: u64) -> IngestError {
    if e.is_timeout() {
        IngestError::Timeout(timeout_secs)
    } else if e.is_connect() {
        IngestError::Network(format!("Connection failed: {e}"))
    } else {
        IngestError::Network(e.to_string())
    }
}

/// Map a non-success status; `None` for 2xx.
pub(crate) fn status_error(status: StatusCode, url: &str) -> Option<IngestError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(IngestError::RateLimitExceeded)
    } else {
        Some(IngestError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedDocument, IngestError> {
        let mut request = self.client.get(url).header(ACCEPT, DEFAULT_ACCEPT);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout_secs))?;

        if let Some(error) = status_error(response.status(), url) {
            return Err(error);
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::Timeout(self.timeout_secs)
            } else {
                IngestError::Network(format!("Failed to read response body from {url}: {e}"))
            }
        })?;

        tracing::debug!(%url, bytes = body.len(), ?content_type, "Fetched");
        Ok(FetchedDocument {
            url: final_url,
            content_type,
            body: body.to_vec(),
        })
    }
}
