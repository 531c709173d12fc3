use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use docket_core::error::IngestError;
use docket_core::traits::Fetcher;
use docket_core::unit::FetchedDocument;
use futures::StreamExt;

/// Headless Chromium fetcher for index pages that build their link lists
/// with JavaScript.
///
/// One browser process is shared by all clones; each fetch opens a tab,
/// reads the rendered DOM and closes the tab. Returns HTML only, so use it
/// for enumeration, not for PDF downloads.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserFetcher {
    pub async fn new() -> Result<Self, IngestError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, IngestError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| IngestError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| IngestError::ConfigError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }
}

/// `CHROME_BIN`, then the real binary inside a snap, then common paths.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CHROME_BIN").map(PathBuf::from) {
        if path.exists() {
            return Some(path);
        }
    }
    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl Fetcher for BrowserFetcher {
    async fn fetch(
        &self,
        url: &str,
        _referer: Option<&str>,
    ) -> Result<FetchedDocument, IngestError> {
        let render = async {
            let page = self
                .browser
                .new_page(url)
                .await
                .map_err(|e| IngestError::Network(format!("Failed to navigate to {url}: {e}")))?;
            page.find_element("body")
                .await
                .map_err(|e| IngestError::Network(format!("Page did not render body: {e}")))?;
            let html = page
                .content()
                .await
                .map_err(|e| IngestError::Network(format!("Failed to read page content: {e}")))?;
            if let Err(e) = page.close().await {
                tracing::debug!(%url, error = %e, "Failed to close tab");
            }
            Ok::<_, IngestError>(html)
        };

        let html = tokio::time::timeout(self.timeout, render)
            .await
            .map_err(|_| IngestError::Timeout(self.timeout.as_secs()))??;

        Ok(FetchedDocument {
            url: url.to_string(),
            content_type: Some("text/html".into()),
            body: html.into_bytes(),
        })
    }
}
