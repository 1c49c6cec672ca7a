//! The container runtime capability the mounter is built on.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use csi_image_common::{CsiImageResult, ImageId, MountTarget, SnapshotKey};

use super::metadata::SnapshotMetadata;
use crate::mounts;

/// Kind of snapshot prepared in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Shared, mounted read-only.
    ReadOnly,
    /// Dedicated to one volume, writable.
    ReadWrite,
}

/// What the runtime reports about an existing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Decoded labels.
    pub metadata: SnapshotMetadata,
    /// Image the snapshot was prepared from.
    pub parent: ImageId,
    /// How the snapshot was prepared.
    pub kind: SnapshotKind,
}

/// Backend-specific snapshot and lease operations (containerd, CRI-O).
///
/// Implementations encode [`SnapshotMetadata`] with
/// [`SnapshotMetadata::to_labels`] and decode it with
/// [`SnapshotMetadata::from_labels`]. Preparing a snapshot whose key already
/// exists must fail rather than overwrite it.
#[async_trait]
pub trait ContainerRuntimeMounter: Send + Sync {
    /// Bind the snapshot's filesystem onto `target`.
    async fn mount(
        &self,
        key: &SnapshotKey,
        target: &MountTarget,
        read_only: bool,
    ) -> CsiImageResult<()>;

    /// Remove every mount stacked on `target`.
    async fn unmount(&self, target: &MountTarget) -> CsiImageResult<()> {
        let target = target.clone();
        tokio::task::spawn_blocking(move || mounts::unmount_all(target.as_path()))
            .await
            .map_err(|e| csi_image_common::CsiImageError::Internal {
                message: format!("unmount task failed: {}", e),
            })?
    }

    /// True if the image is already present in the runtime.
    async fn image_exists(&self, image: &str) -> bool;

    /// Content identity of the image's root filesystem.
    async fn image_id(&self, image: &str) -> CsiImageResult<ImageId>;

    /// Prepare the shared read-only snapshot `metadata.key()` on top of `parent`.
    async fn prepare_read_only_snapshot(
        &self,
        parent: &ImageId,
        metadata: &SnapshotMetadata,
    ) -> CsiImageResult<()>;

    /// Prepare a writable snapshot `metadata.key()` on top of `parent`.
    async fn prepare_rw_snapshot(
        &self,
        parent: &ImageId,
        metadata: &SnapshotMetadata,
    ) -> CsiImageResult<()>;

    /// Replace the labels of an existing snapshot.
    async fn update_snapshot_metadata(&self, metadata: &SnapshotMetadata) -> CsiImageResult<()>;

    /// Remove a snapshot.
    async fn destroy_snapshot(&self, key: &SnapshotKey) -> CsiImageResult<()>;

    /// Look up one snapshot; `None` if it does not exist.
    async fn snapshot_info(&self, key: &SnapshotKey) -> CsiImageResult<Option<SnapshotInfo>>;

    /// Every snapshot managed by this plugin.
    async fn list_snapshots(&self) -> CsiImageResult<Vec<SnapshotMetadata>>;

    /// Hold a lease for `target` so the runtime GC leaves its resources alone.
    async fn add_lease(&self, target: &MountTarget) -> CsiImageResult<()>;

    /// Release the lease held for `target`.
    async fn remove_lease(&self, target: &MountTarget) -> CsiImageResult<()>;

    /// Every mount point on the host, read in one pass.
    async fn mount_table(&self) -> CsiImageResult<HashSet<PathBuf>> {
        tokio::task::spawn_blocking(mounts::mount_table)
            .await
            .map_err(|e| csi_image_common::CsiImageError::Internal {
                message: format!("mount table task failed: {}", e),
            })?
    }
}
