//! Collaborators the upload worker is built around.
//!
//! A [`Router`] decides where a file goes, an [`UploadStrategy`] moves its
//! bytes. Both are injected; the worker never performs transfers itself.
//! The mirror implementations here copy into a local directory tree and are
//! what the `uploader push` command uses.

use crate::error::UploadError;
use crate::paths::{modified_millis, normalize_path, EpochMillis};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Moves one file to one destination.
pub trait UploadStrategy: Send + Sync {
    /// Upload `path` to `destination`.
    ///
    /// Returns the timestamp to record as the file's last upload, normally
    /// the modification time of the version that was sent.
    fn upload(&self, path: &Path, destination: &Url) -> Result<EpochMillis, UploadError>;
}

/// Maps a file to the destinations it should be uploaded to.
pub trait Router: Send + Sync {
    /// An empty list means nothing to do.
    fn route(&self, path: &Path) -> Vec<Url>;
}

impl<T: UploadStrategy + ?Sized> UploadStrategy for Arc<T> {
    fn upload(&self, path: &Path, destination: &Url) -> Result<EpochMillis, UploadError> {
        (**self).upload(path, destination)
    }
}

impl<F> Router for F
where
    F: Fn(&Path) -> Vec<Url> + Send + Sync,
{
    fn route(&self, path: &Path) -> Vec<Url> {
        self(path)
    }
}

/// Routes every file to the same fixed destinations.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    destinations: Vec<Url>,
}

impl StaticRouter {
    pub fn new(destinations: Vec<Url>) -> Self {
        Self { destinations }
    }
}

impl Router for StaticRouter {
    fn route(&self, _path: &Path) -> Vec<Url> {
        self.destinations.clone()
    }
}

/// Routes files under `source_root` to the same relative path under
/// `mirror_root`, as `file://` URLs. Files outside the source root get no
/// destination.
#[derive(Debug, Clone)]
pub struct MirrorRouter {
    source_root: PathBuf,
    mirror_root: PathBuf,
}

impl MirrorRouter {
    pub fn new(source_root: impl AsRef<Path>, mirror_root: impl AsRef<Path>) -> Self {
        Self {
            source_root: normalize_path(source_root.as_ref()),
            mirror_root: normalize_path(mirror_root.as_ref()),
        }
    }
}

impl Router for MirrorRouter {
    fn route(&self, path: &Path) -> Vec<Url> {
        let path = normalize_path(path);
        let relative = match path.strip_prefix(&self.source_root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => {
                debug!(
                    "{} is outside {}, no destination",
                    path.display(),
                    self.source_root.display()
                );
                return Vec::new();
            }
        };

        match Url::from_file_path(self.mirror_root.join(relative)) {
            Ok(url) => vec![url],
            Err(()) => {
                warn!("Cannot express mirror target for {} as a URL", path.display());
                Vec::new()
            }
        }
    }
}

/// Copies the file to the local path named by a `file://` destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorStrategy;

impl UploadStrategy for MirrorStrategy {
    fn upload(&self, path: &Path, destination: &Url) -> Result<EpochMillis, UploadError> {
        if destination.scheme() != "file" {
            return Err(UploadError::Destination(destination.to_string()));
        }
        let target = destination
            .to_file_path()
            .map_err(|()| UploadError::Destination(destination.to_string()))?;

        // Stamp with the mtime seen before copying; a write racing the copy
        // will look newer on the next pass and be sent again.
        let modified = modified_millis(&fs::metadata(path)?)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(path, &target)?;
        debug!("Copied {} bytes from {} to {}", bytes, path.display(), target.display());

        Ok(modified)
    }
}
