//! Identifiers shared by the pull and mount machinery.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CsiImageError, CsiImageResult};

/// Prefix shared by snapshot keys and snapshot labels.
pub const LABEL_PREFIX: &str = "csi-image.warm-metal.tech";

/// Content-addressed identity of an image's root filesystem.
///
/// Two references resolving to the same rootfs share one `ImageId`, which is
/// what lets read-only mounts of identical images share a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Wrap a runtime-reported image identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a runtime snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    /// Key of the shared read-only snapshot for an image.
    #[must_use]
    pub fn read_only(image: &ImageId) -> Self {
        Self(format!("{}-{}", LABEL_PREFIX, image.as_str()))
    }

    /// Key of the dedicated read-write snapshot for a volume.
    #[must_use]
    pub fn read_write(volume_id: &str) -> Self {
        Self(format!("{}-rw-{}", LABEL_PREFIX, volume_id))
    }

    /// Wrap an existing snapshot name, e.g. one listed by the runtime.
    #[must_use]
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute path a volume is bound to inside the workload's view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountTarget(PathBuf);

impl MountTarget {
    /// Create a mount target, requiring an absolute path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or relative.
    pub fn new(path: impl Into<PathBuf>) -> CsiImageResult<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(CsiImageError::invalid_argument("target path is empty"));
        }
        if !path.is_absolute() {
            return Err(CsiImageError::invalid_argument(format!(
                "target path {} is not absolute",
                path.display()
            )));
        }
        Ok(Self(path))
    }

    /// Get the target as a path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for MountTarget {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
