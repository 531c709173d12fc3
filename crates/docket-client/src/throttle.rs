//! Per-domain request spacing for polite crawling.
//!
//! Wraps any [`Fetcher`] so that requests to the same scheme/host/port are
//! at least `delay` (plus jitter) apart. Each caller reserves the next free
//! slot for its domain under a short lock and sleeps outside it, so
//! concurrent workers queue up instead of bursting together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use docket_core::error::IngestError;
use docket_core::retry::jitter_ms;
use docket_core::traits::Fetcher;
use docket_core::unit::FetchedDocument;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum gap between consecutive requests to the same domain.
    pub delay: Duration,
    /// Upper bound of uniform random jitter added to `delay`.
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        self.delay + Duration::from_millis(jitter_ms(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, 500ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    /// Earliest start time for the next request per domain.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<F: Fetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `scheme://host:port`, or `None` for unparseable URLs.
    fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    async fn wait_for_domain(&self, domain: &str) {
        let start = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(domain).copied().filter(|t| *t > now).unwrap_or(now);
            slots.insert(domain.to_string(), start + self.config.effective_delay());
            start
        };

        let now = Instant::now();
        if start > now {
            tracing::debug!(
                %domain,
                sleep_ms = (start - now).as_millis() as u64,
                "Throttling request"
            );
            tokio::time::sleep_until(start).await;
        }
    }
}

impl<F: Fetcher> Fetcher for ThrottledFetcher<F> {
    async fn fetch(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedDocument, IngestError> {
        if let Some(domain) = Self::domain_key(url) {
            self.wait_for_domain(&domain).await;
        }
        self.inner.fetch(url, referer).await
    }
}
