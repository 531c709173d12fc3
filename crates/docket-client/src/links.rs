//! Discovers PDF links on paginated index pages.

use std::collections::HashSet;

use docket_core::error::IngestError;
use docket_core::retry::{RetryPolicy, RetryState};
use docket_core::traits::{Enumerator, Fetcher};
use docket_core::unit::{META_REFERRER, PageRange, WorkUnit, expand_template};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use scraper::{Html, Selector};
use url::Url;

/// A link found on an index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfLink {
    pub url: String,
    /// Visible anchor text, whitespace-collapsed.
    pub label: String,
}

/// Every `<a href>` on the page whose resolved path ends in `.pdf`, in
/// document order and without repeats.
pub fn extract_pdf_links(html: &str, page_url: &str) -> Result<Vec<PdfLink>, IngestError> {
    let base = Url::parse(page_url)
        .map_err(|e| IngestError::Enumeration(format!("invalid index URL {page_url}: {e}")))?;
    let selector = Selector::parse("a[href]")
        .map_err(|e| IngestError::Parse(format!("anchor selector: {e}")))?;
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https")
            || !resolved.path().to_ascii_lowercase().ends_with(".pdf")
        {
            continue;
        }
        resolved.set_fragment(None);
        if !seen.insert(resolved.to_string()) {
            continue;
        }
        let label = anchor
            .text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ");
        links.push(PdfLink {
            url: resolved.into(),
            label,
        });
    }
    Ok(links)
}

/// Walks index pages and yields one unit per PDF link.
///
/// Units carry `referrer` (the index page), `label` and `page` metadata.
/// Each index page is fetched under the retry policy; a page that still
/// fails ends the enumeration with that error.
#[derive(Clone)]
pub struct PdfLinkEnumerator<F> {
    fetcher: F,
    pages: Vec<(i64, String)>,
    policy: RetryPolicy,
}

impl<F: Fetcher> PdfLinkEnumerator<F> {
    /// One index page per number in `range`, built from a `{n}` template.
    pub fn new(fetcher: F, range: PageRange, template: &str) -> Self {
        let pages = range
            .iter()
            .map(|n| (n, expand_template(template, n)))
            .collect();
        Self {
            fetcher,
            pages,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn fetch_index(&self, url: &str) -> Result<String, IngestError> {
        let mut state = RetryState::default();
        loop {
            state.attempt += 1;
            match self.fetcher.fetch(url, None).await {
                Ok(document) => return Ok(document.text()),
                Err(e) => match state.on_failure(&self.policy, e) {
                    Some(delay) => {
                        tracing::warn!(
                            %url,
                            attempt = state.attempt,
                            "Index page fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(state.into_error(&self.policy)),
                },
            }
        }
    }

    async fn units_for_page(&self, page: i64, url: &str) -> Result<Vec<WorkUnit>, IngestError> {
        let html = self.fetch_index(url).await?;
        let links = extract_pdf_links(&html, url)?;
        tracing::info!(page, %url, links = links.len(), "Scanned index page");

        Ok(links
            .into_iter()
            .map(|link| {
                WorkUnit::new(link.url)
                    .with_meta(META_REFERRER, url)
                    .with_meta("label", link.label)
                    .with_meta("page", page.to_string())
            })
            .collect())
    }
}

impl<F: Fetcher> Enumerator for PdfLinkEnumerator<F> {
    fn enumerate(&self) -> BoxStream<'_, Result<WorkUnit, IngestError>> {
        stream::iter(self.pages.iter())
            .then(move |(page, url)| self.units_for_page(*page, url))
            .map_ok(|units| stream::iter(units.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}
