//! Filesystem store for rendered preview images
//!
//! Each [`CacheKey`] owns exactly one file, `{base}/{key}.png`. The
//! filesystem is the only source of truth for cache hits; nothing is kept in
//! memory.
//!
//! Partially written files never appear under `{base}`: commits stage into a
//! hidden sibling directory, `{parent}/.{base_name}.staging`, and rename from
//! there. Keep both on the same filesystem.

use crate::{CacheKey, PreviewError};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

/// URL path under which the HTTP layer serves the store.
pub const IMAGES_ROUTE: &str = "images";

/// Scheme and host of the inbound request, used to build absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub scheme: String,
    pub host: String,
}

impl RequestContext {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }
}

/// An artifact that has been written and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
    staging_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let staging_dir = staging_dir_for(&base_dir);
        Self {
            base_dir,
            staging_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where commits write before the rename into [`Self::base_dir`].
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.base_dir.join(key.file_name())
    }

    pub async fn ensure_dir(&self) -> Result<(), PreviewError> {
        for dir in [&self.base_dir, &self.staging_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PreviewError::FilesystemError(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Whether an artifact exists for `key`.
    ///
    /// A missing file is `Ok(false)`; any other failure (permissions, I/O)
    /// is an error rather than a silent miss.
    pub async fn exists(&self, key: &CacheKey) -> Result<bool, PreviewError> {
        let path = self.path_for(key);
        tokio::fs::try_exists(&path).await.map_err(|e| {
            PreviewError::FilesystemError(format!("cannot stat {}: {e}", path.display()))
        })
    }

    /// `{scheme}://{host}/images/{key}.png` for the request's origin.
    pub fn resolve_url(&self, ctx: &RequestContext, key: &CacheKey) -> String {
        let file_name = key.file_name();
        match Url::parse(&format!("{}://{}/", ctx.scheme, ctx.host)) {
            Ok(mut url) => {
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.clear().push(IMAGES_ROUTE).push(&file_name);
                }
                url.to_string()
            }
            Err(_) => format!("{}://{}/{}/{}", ctx.scheme, ctx.host, IMAGES_ROUTE, file_name),
        }
    }

    /// Verify `png` is an image and atomically place it at the key's path.
    ///
    /// The bytes go to a uniquely named file in the staging directory first
    /// and are renamed over the target, so a concurrent reader sees either the
    /// old file or the new one. On any failure the target path is left
    /// untouched.
    pub async fn commit(&self, key: &CacheKey, png: &[u8]) -> Result<StoredArtifact, PreviewError> {
        let (width, height) = image::ImageReader::new(Cursor::new(png))
            .with_guessed_format()
            .map_err(|e| PreviewError::CaptureFailed(format!("unreadable screenshot: {e}")))?
            .into_dimensions()
            .map_err(|e| PreviewError::CaptureFailed(format!("invalid screenshot image: {e}")))?;

        self.ensure_dir().await?;

        let target = self.path_for(key);
        let temp = self
            .staging_dir
            .join(format!("{}.{}.tmp", key, uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&temp, png).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(PreviewError::FilesystemError(format!(
                "cannot write {}: {e}",
                temp.display()
            )));
        }

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(PreviewError::FilesystemError(format!(
                "cannot move artifact into {}: {e}",
                target.display()
            )));
        }

        debug!(key = %key, path = %target.display(), width, height, "artifact committed");

        Ok(StoredArtifact {
            key: key.clone(),
            path: target,
            size: png.len(),
            width,
            height,
        })
    }

    /// Delete every file in the store, regardless of key.
    ///
    /// This is an irreversible full flush. Returns how many files were
    /// removed, or the first error hit. A store directory that does not exist
    /// yet has nothing to purge.
    pub async fn purge_all(&self) -> Result<usize, PreviewError> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(PreviewError::FilesystemError(format!(
                    "unable to read {}: {e}",
                    self.base_dir.display()
                )))
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            PreviewError::FilesystemError(format!("unable to list {}: {e}", self.base_dir.display()))
        })? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| {
                PreviewError::FilesystemError(format!("cannot stat {}: {e}", path.display()))
            })?;

            if file_type.is_dir() {
                warn!(path = %path.display(), "skipping directory in image store");
                continue;
            }

            tokio::fs::remove_file(&path).await.map_err(|e| {
                PreviewError::FilesystemError(format!("cannot delete {}: {e}", path.display()))
            })?;
            removed += 1;
        }

        info!(removed, dir = %self.base_dir.display(), "image store purged");
        Ok(removed)
    }
}

fn staging_dir_for(base_dir: &Path) -> PathBuf {
    let name = base_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| IMAGES_ROUTE.to_string());
    base_dir
        .parent()
        .unwrap_or(base_dir)
        .join(format!(".{name}.staging"))
}
