//! Local staging helpers and the filesystem-backed [`ArtifactStore`].

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use url::Url;

use crate::error::ArtifactError;
use crate::traits::ArtifactStore;
use crate::unit::{Artifact, Metadata};

const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_DISAMBIGUATION: u32 = 10_000;

/// Strip characters that are not allowed in file names on common platforms.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| !UNSAFE_CHARS.contains(c) && !c.is_control())
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .to_string()
}

fn percent_decode(segment: &str) -> String {
    // form_urlencoded treats these as syntax; keep them literal.
    let escaped = segment
        .replace('+', "%2B")
        .replace('&', "%26")
        .replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .map(|(key, _)| key.into_owned())
        .next()
        .unwrap_or_default()
}

/// Local file name for a downloaded PDF: the decoded last path segment,
/// sanitized, with `.pdf` appended when missing.
pub fn safe_filename_from_url(url: &str) -> String {
    let segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .unwrap_or_default()
            .to_string(),
    };

    let mut name = sanitize(&percent_decode(&segment));
    if name.is_empty() {
        name = "document".to_string();
    }
    if !name.to_ascii_lowercase().ends_with(".pdf") {
        name.push_str(".pdf");
    }
    name
}

/// File name of `key` without its extension: `a/b/report.pdf` → `report`.
pub fn base_name_from_key(key: &str) -> &str {
    let file = key.rsplit('/').next().unwrap_or(key);
    match file.rfind('.') {
        Some(0) | None => file,
        Some(dot) => &file[..dot],
    }
}

/// Join a destination prefix and a file name into an object key.
pub fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({n}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}

/// Move a staged temp file to `dir/name` without overwriting anything,
/// falling back to `stem (1).ext`, `stem (2).ext`, …
///
/// Each candidate is claimed atomically, so concurrent callers never land
/// on the same path.
pub fn persist_unique(mut staged: NamedTempFile, dir: &Path, name: &str) -> io::Result<PathBuf> {
    for n in 0..MAX_DISAMBIGUATION {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(numbered(name, n))
        };
        match staged.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => staged = e.file,
            Err(e) => return Err(e.error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {name} in {}", dir.display()),
    ))
}

/// Write `bytes` to a synced temp file in `dir`.
///
/// Nothing is left on disk if the returned handle is dropped unpersisted.
pub fn stage_temp(dir: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_data()?;
    Ok(staged)
}

/// Write `bytes` to a temp file in `dir` and persist it under a unique name.
///
/// The temp file is removed if anything fails before the final rename.
pub fn stage_bytes(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    persist_unique(stage_temp(dir, bytes)?, dir, name)
}

/// Describe a file that an earlier run staged and kept on disk.
pub fn load_staged(path: PathBuf, source_key: String, metadata: Metadata) -> io::Result<Artifact> {
    let bytes = std::fs::read(&path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "staged path has no file name")
        })?;
    Ok(Artifact {
        name,
        size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        local_path: path,
        source_key,
        metadata,
    })
}

/// A directory used as a bucket. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && !key.contains('\\')
            && key
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(ArtifactError::PermissionDenied(format!("invalid key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

fn blocking_failed(key: &str, e: tokio::task::JoinError) -> ArtifactError {
    ArtifactError::Unavailable(format!("{key}: {e}"))
}

fn collect_keys(root: &Path) -> io::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }
            // In-flight uploads from `put`.
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

impl ArtifactStore for FsArtifactStore {
    async fn put(&self, local: &Path, key: &str) -> Result<(), ArtifactError> {
        let dest = self.resolve(key)?;
        let local = local.to_path_buf();
        let owned_key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let parent = dest.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent)?;
            let staged = NamedTempFile::new_in(parent)?;
            std::fs::copy(&local, staged.path())?;
            staged.as_file().sync_data()?;
            staged.persist(&dest).map_err(|e| e.error)?;
            Ok::<_, io::Error>(())
        })
        .await
        .map_err(|e| blocking_failed(key, e))?
        .map_err(|e| ArtifactError::from_io(&owned_key, &e))?;

        tracing::debug!(key, root = %self.root.display(), "Stored artifact");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ArtifactError::from_io(key, &e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let root = self.root.clone();
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut keys = tokio::task::spawn_blocking(move || collect_keys(&root))
            .await
            .map_err(|e| blocking_failed(prefix, e))?
            .map_err(|e| ArtifactError::from_io(prefix, &e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
