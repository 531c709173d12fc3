use std::time::Duration;

use docket_core::error::IngestError;
use docket_core::poll::{PollConfig, poll_until};
use docket_core::traits::Transformer;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::fetcher::classify;

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";
const DEFAULT_MODEL: &str = "mistral-ocr-latest";
const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(180);
/// Lifetime of the signed document URL, in hours.
const SIGNED_URL_EXPIRY: u32 = 1;

/// Mistral OCR client implementing the transform boundary.
///
/// Each document is uploaded with `purpose=ocr`, its signed URL is polled
/// for until the file is available, and the OCR endpoint is called on that
/// URL. The raw JSON response is returned unchanged.
#[derive(Clone)]
pub struct MistralOcr {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    include_images: bool,
    timeout_secs: u64,
    poll: PollConfig,
}

impl MistralOcr {
    pub fn new(api_key: &str) -> Result<Self, IngestError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, IngestError> {
        Self::build(api_key, base_url, DEFAULT_OCR_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, IngestError> {
        let rebuilt = Self::build(&self.api_key, &self.base_url, timeout)?;
        Ok(Self {
            model: self.model,
            include_images: self.include_images,
            poll: self.poll,
            ..rebuilt
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Ask for page images as base64 in the response.
    pub fn with_images(mut self, include: bool) -> Self {
        self.include_images = include;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    fn build(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, IngestError> {
        if api_key.trim().is_empty() {
            return Err(IngestError::ConfigError("Mistral API key is empty".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_MODEL.to_string(),
            include_images: false,
            timeout_secs: timeout.as_secs(),
            poll: PollConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(30),
            },
        })
    }

    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, IngestError> {
        let part = Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/pdf")
            .map_err(|e| IngestError::InvalidContent(format!("multipart for {name}: {e}")))?;
        let form = Form::new().text("purpose", "ocr").part("file", part);

        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout_secs))?;
        let uploaded: UploadedFile = read_json(response, self.timeout_secs).await?;
        tracing::debug!(file = name, file_id = %uploaded.id, "Uploaded document for OCR");
        Ok(uploaded.id)
    }

    fn signed_url_endpoint(&self, file_id: &str) -> String {
        format!(
            "{}/files/{file_id}/url?expiry={SIGNED_URL_EXPIRY}",
            self.base_url
        )
    }

    /// `None` while the uploaded file is not yet visible.
    async fn signed_url(&self, file_id: &str) -> Result<Option<String>, IngestError> {
        let response = self
            .client
            .get(self.signed_url_endpoint(file_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout_secs))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let signed: SignedUrl = read_json(response, self.timeout_secs).await?;
        Ok(Some(signed.url))
    }

    async fn run_ocr(&self, document_url: String) -> Result<String, IngestError> {
        let request = OcrRequest {
            model: &self.model,
            document: DocumentChunk {
                kind: "document_url",
                document_url,
            },
            include_image_base64: self.include_images,
        };
        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify(&e, self.timeout_secs))?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(body)
    }
}

// ---- Mistral API types ----

#[derive(Deserialize)]
struct UploadedFile {
    id: String,
}

#[derive(Deserialize)]
struct SignedUrl {
    url: String,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: DocumentChunk,
    include_image_base64: bool,
}

#[derive(Serialize)]
struct DocumentChunk {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

fn api_error(status: StatusCode, body: &str) -> IngestError {
    let status_code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return IngestError::RateLimitExceeded;
    }
    let message = serde_json::from_str::<ApiError>(body)
        .ok()
        .and_then(|e| {
            e.message.or_else(|| {
                e.detail.map(|d| match d {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
            })
        })
        .unwrap_or_else(|| format!("HTTP {status_code}: {body}"));

    IngestError::Transform {
        message,
        status_code,
        retryable: status_code == 408 || status_code >= 500,
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    timeout_secs: u64,
) -> Result<T, IngestError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| classify(&e, timeout_secs))?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| IngestError::Parse(format!("unexpected Mistral response: {e}")))
}

impl Transformer for MistralOcr {
    async fn transform(&self, name: &str, bytes: Vec<u8>) -> Result<String, IngestError> {
        let file_id = self.upload(name, bytes).await?;
        let document_url = poll_until(self.poll, || self.signed_url(&file_id))
            .await
            .into_result(&self.poll)?;
        let output = self.run_ocr(document_url).await?;
        tracing::debug!(file = name, bytes = output.len(), "OCR completed");
        Ok(output)
    }

    async fn transform_url(&self, url: &str) -> Result<String, IngestError> {
        let output = self.run_ocr(url.to_string()).await?;
        tracing::debug!(url, bytes = output.len(), "OCR completed");
        Ok(output)
    }
}
