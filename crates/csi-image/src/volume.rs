//! Validation of publish/unpublish requests coming from the CSI layer.

use std::collections::HashMap;
use std::path::PathBuf;

use csi_image_common::{CsiImageError, CsiImageResult, MountTarget};
use csi_image_remote::ImageReference;

/// Volume context key carrying the image reference.
pub const CTX_IMAGE: &str = "image";
/// Volume context key forcing a pull even if the image is present.
pub const CTX_PULL_ALWAYS: &str = "pullAlways";
/// Volume context key kubelet fills with the pod UID.
pub const CTX_POD_UID: &str = "csi.storage.k8s.io/pod.uid";

/// Access mode requested for the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Writable by a single node.
    #[default]
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Writable by a single node, one writer.
    MultiNodeSingleWriter,
    /// Writable by many nodes.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// True for the reader-only modes.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

/// Fields of a publish request the core cares about.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    /// Volume ID; for persistent volumes this is the volume handle.
    pub volume_id: String,
    /// Where to bind the volume.
    pub target_path: PathBuf,
    /// Volume attributes.
    pub volume_context: HashMap<String, String>,
    /// Read-only flag of the request.
    pub read_only: bool,
    /// Requested access mode.
    pub access_mode: AccessMode,
}

/// A validated publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Volume ID.
    pub volume_id: String,
    /// Mount target.
    pub target: MountTarget,
    /// Effective image reference.
    pub image: ImageReference,
    /// Mount the shared read-only snapshot.
    pub read_only: bool,
    /// Pull even if the image is present.
    pub pull_always: bool,
    /// UID of the pod the volume is for, if known.
    pub pod_uid: Option<String>,
}

impl PublishRequest {
    /// Validate the request and resolve the effective image.
    ///
    /// A non-empty `image` attribute wins; otherwise the volume ID is taken
    /// as the image, which is how persistent volumes carry it in their
    /// volume handle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the volume ID, target path or image is
    /// missing or malformed.
    pub fn validate(&self) -> CsiImageResult<VolumeSpec> {
        if self.volume_id.trim().is_empty() {
            return Err(CsiImageError::invalid_argument("volume ID is missing"));
        }
        if self.target_path.as_os_str().is_empty() {
            return Err(CsiImageError::invalid_argument("target path is missing"));
        }
        let target = MountTarget::new(&self.target_path)?;

        let image = self
            .volume_context
            .get(CTX_IMAGE)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(self.volume_id.trim());
        let image = ImageReference::parse(image)?;

        let pull_always = self
            .volume_context
            .get(CTX_PULL_ALWAYS)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let pod_uid = self
            .volume_context
            .get(CTX_POD_UID)
            .filter(|s| !s.is_empty())
            .cloned();

        Ok(VolumeSpec {
            volume_id: self.volume_id.clone(),
            target,
            image,
            read_only: self.read_only || self.access_mode.is_read_only(),
            pull_always,
            pod_uid,
        })
    }
}

/// Validate an unpublish request.
///
/// # Errors
///
/// Returns `InvalidArgument` if the volume ID or target path is missing.
pub fn validate_unpublish(volume_id: &str, target_path: &std::path::Path) -> CsiImageResult<MountTarget> {
    if volume_id.trim().is_empty() {
        return Err(CsiImageError::invalid_argument("volume ID is missing"));
    }
    if target_path.as_os_str().is_empty() {
        return Err(CsiImageError::invalid_argument("target path is missing"));
    }
    MountTarget::new(target_path)
}
