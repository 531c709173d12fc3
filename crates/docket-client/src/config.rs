use std::path::{Path, PathBuf};

use docket_core::artifact::FsArtifactStore;
use docket_core::error::{ArtifactError, IngestError};
use docket_core::traits::ArtifactStore;

use crate::store::HttpArtifactStore;

/// Where artifacts are uploaded to and read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// A local (or mounted) directory used as a bucket.
    Fs { root: PathBuf },
    /// An HTTP object store with optional bearer token.
    Http { url: String, token: Option<String> },
}

impl StorageConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DOCKET_STORE_URL` selects the HTTP store, with `DOCKET_STORE_TOKEN`
    ///   as its optional bearer token
    /// - otherwise `DOCKET_STORE_ROOT` selects a directory store
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, IngestError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("DOCKET_STORE_URL") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(IngestError::ConfigError(format!(
                    "Invalid DOCKET_STORE_URL '{url}': must be an http(s) URL"
                )));
            }
            return Ok(StorageConfig::Http {
                url,
                token: non_empty("DOCKET_STORE_TOKEN"),
            });
        }

        match non_empty("DOCKET_STORE_ROOT") {
            Some(root) => Ok(StorageConfig::Fs {
                root: PathBuf::from(root),
            }),
            None => Err(IngestError::ConfigError(
                "Neither DOCKET_STORE_URL nor DOCKET_STORE_ROOT is set. Required for uploads \
                 (or pass --no-upload)."
                    .into(),
            )),
        }
    }

    pub fn connect(&self) -> Result<ConfiguredStore, IngestError> {
        Ok(match self {
            StorageConfig::Fs { root } => ConfiguredStore::Fs(FsArtifactStore::new(root)),
            StorageConfig::Http { url, token } => {
                ConfiguredStore::Http(HttpArtifactStore::new(url, token.clone())?)
            }
        })
    }
}

/// Whichever store the configuration selected.
#[derive(Clone)]
pub enum ConfiguredStore {
    Fs(FsArtifactStore),
    Http(HttpArtifactStore),
}

impl ArtifactStore for ConfiguredStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ArtifactError> {
        match self {
            ConfiguredStore::Fs(store) => store.put(local, key).await,
            ConfiguredStore::Http(store) => store.put(local, key).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        match self {
            ConfiguredStore::Fs(store) => store.get(key).await,
            ConfiguredStore::Http(store) => store.get(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        match self {
            ConfiguredStore::Fs(store) => store.list(prefix).await,
            ConfiguredStore::Http(store) => store.list(prefix).await,
        }
    }
}
