#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod fetcher;
pub mod links;
pub mod ocr;
pub mod store;
pub mod throttle;


#[cfg(feature = "browser")]
pub use browser::BrowserFetcher;
pub use config::{ConfiguredStore, StorageConfig};
pub use fetcher::ReqwestFetcher;
pub use links::{PdfLinkEnumerator, extract_pdf_links};
pub use ocr::MistralOcr;
pub use store::HttpArtifactStore;
pub use throttle::{ThrottleConfig, ThrottledFetcher};
