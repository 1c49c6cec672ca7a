//! Snapshot sharing, mounting and teardown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use csi_image_common::{CsiImageError, CsiImageResult, MountTarget, NodeConfig, SnapshotKey};
use parking_lot::RwLock;

use super::metadata::SnapshotMetadata;
use super::ratelimit::RateLimiter;
use super::runtime::{ContainerRuntimeMounter, SnapshotKind};

/// Maps (image, target) pairs onto runtime snapshots.
///
/// Read-only mounts of the same image share one snapshot whose labels list
/// every target; read-write mounts get a snapshot of their own. The
/// check-then-create sequence is not atomic at the runtime API, so every
/// ref/unref runs under one lock.
pub struct SnapshotMounter {
    runtime: Arc<dyn ContainerRuntimeMounter>,
    guard: tokio::sync::Mutex<()>,
    /// Which snapshot each known target references.
    index: RwLock<HashMap<MountTarget, SnapshotKey>>,
    mount_limiter: RateLimiter,
    unmount_limiter: RateLimiter,
}

impl SnapshotMounter {
    /// Create a mounter and reconcile it against the runtime.
    ///
    /// Every target recorded on a managed snapshot that is no longer a mount
    /// point gets its lease released, recovering from crashes between the
    /// unmount and the unref.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime's snapshots cannot be listed.
    pub async fn new(
        runtime: Arc<dyn ContainerRuntimeMounter>,
        config: &NodeConfig,
    ) -> CsiImageResult<Self> {
        let mounter = Self {
            runtime,
            guard: tokio::sync::Mutex::new(()),
            index: RwLock::new(HashMap::new()),
            mount_limiter: RateLimiter::new("mount", config.mount_rate, config.mount_burst),
            unmount_limiter: RateLimiter::new("unmount", config.unmount_rate, config.unmount_burst),
        };
        mounter.reconcile().await?;
        Ok(mounter)
    }

    async fn reconcile(&self) -> CsiImageResult<()> {
        let snapshots = self.runtime.list_snapshots().await?;
        let mount_table = self.runtime.mount_table().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cannot read mount table, treating every target as unmounted");
            HashSet::new()
        });
        let mut released = HashSet::new();

        for metadata in &snapshots {
            for target in metadata.targets() {
                self.index
                    .write()
                    .insert(target.clone(), metadata.key().clone());

                let mounted = mount_table.contains(target.as_path());
                if mounted || released.contains(target) {
                    continue;
                }

                match self.runtime.remove_lease(target).await {
                    Ok(()) => {
                        tracing::info!(snapshot = %metadata.key(), target = %target, "Released stale lease");
                        released.insert(target.clone());
                    }
                    Err(e) => {
                        tracing::warn!(target = %target, error = %e, "Failed to release stale lease");
                    }
                }
            }
        }

        tracing::info!(
            snapshots = snapshots.len(),
            targets = self.index.read().len(),
            released = released.len(),
            "Snapshot cache rebuilt"
        );
        Ok(())
    }

    /// True if the runtime already has `image`.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.runtime.image_exists(image).await
    }

    /// Snapshot currently backing `target`, if known.
    pub fn snapshot_for(&self, target: &MountTarget) -> Option<SnapshotKey> {
        self.index.read().get(target).cloned()
    }

    /// Known targets referencing `key`.
    pub fn targets_of(&self, key: &SnapshotKey) -> Vec<MountTarget> {
        let mut targets: Vec<_> = self
            .index
            .read()
            .iter()
            .filter(|(_, k)| *k == key)
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
    }

    /// Mount `image` on `target`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error after rolling back the lease
    /// and any snapshot reference taken for this attempt.
    pub async fn mount(
        &self,
        volume_id: &str,
        target: &MountTarget,
        image: &str,
        read_only: bool,
    ) -> CsiImageResult<()> {
        self.mount_limiter.acquire().await?;
        let _guard = self.guard.lock().await;

        tracing::debug!(volume_id, target = %target, image, read_only, "Mounting snapshot");
        self.runtime.add_lease(target).await?;

        let key = match self.ref_snapshot(volume_id, target, image, read_only).await {
            Ok(key) => key,
            Err(e) => {
                self.release_lease(target).await;
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.mount(&key, target, read_only).await {
            tracing::error!(snapshot = %key, target = %target, error = %e, "Mount failed, rolling back");
            if let Err(unref_err) = self.unref_snapshot(&key, target).await {
                tracing::error!(snapshot = %key, target = %target, error = %unref_err, "Rollback left a reference behind");
            }
            self.release_lease(target).await;
            return Err(e);
        }

        self.index.write().insert(target.clone(), key.clone());
        tracing::info!(volume_id, snapshot = %key, target = %target, "Snapshot mounted");
        Ok(())
    }

    /// Unmount `target` and drop its snapshot reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount or the metadata update fails.
    pub async fn unmount(&self, volume_id: &str, target: &MountTarget) -> CsiImageResult<()> {
        self.unmount_limiter.acquire().await?;
        let _guard = self.guard.lock().await;

        tracing::debug!(volume_id, target = %target, "Unmounting snapshot");
        self.runtime.unmount(target).await?;

        let cached = self.snapshot_for(target);
        let key = match cached {
            Some(key) => Some(key),
            None => self.find_snapshot(target).await?,
        };

        match &key {
            Some(key) => self.unref_snapshot(key, target).await?,
            None => tracing::warn!(volume_id, target = %target, "No snapshot references target"),
        }

        self.runtime.remove_lease(target).await?;
        self.index.write().remove(target);
        tracing::info!(volume_id, target = %target, snapshot = ?key, "Snapshot unmounted");
        Ok(())
    }

    async fn ref_snapshot(
        &self,
        volume_id: &str,
        target: &MountTarget,
        image: &str,
        read_only: bool,
    ) -> CsiImageResult<SnapshotKey> {
        let image_id = self.runtime.image_id(image).await?;
        let (key, kind) = if read_only {
            (SnapshotKey::read_only(&image_id), SnapshotKind::ReadOnly)
        } else {
            (SnapshotKey::read_write(volume_id), SnapshotKind::ReadWrite)
        };

        match self.runtime.snapshot_info(&key).await? {
            Some(info) => {
                if info.parent != image_id || info.kind != kind {
                    return Err(CsiImageError::SnapshotConflict {
                        key: key.to_string(),
                        message: format!(
                            "expected {:?} snapshot of {}, found {:?} snapshot of {}",
                            kind, image_id, info.kind, info.parent
                        ),
                    });
                }
                let mut metadata = info.metadata;
                if metadata.add_target(target.clone()) {
                    self.runtime.update_snapshot_metadata(&metadata).await?;
                }
                tracing::debug!(
                    snapshot = %key,
                    targets = metadata.targets().len(),
                    "Referenced existing snapshot"
                );
            }
            None => {
                let metadata = SnapshotMetadata::with_target(key.clone(), target.clone());
                match kind {
                    SnapshotKind::ReadOnly => {
                        self.runtime
                            .prepare_read_only_snapshot(&image_id, &metadata)
                            .await?;
                    }
                    SnapshotKind::ReadWrite => {
                        self.runtime.prepare_rw_snapshot(&image_id, &metadata).await?;
                    }
                }
                tracing::debug!(snapshot = %key, ?kind, parent = %image_id, "Prepared snapshot");
            }
        }

        Ok(key)
    }

    async fn unref_snapshot(&self, key: &SnapshotKey, target: &MountTarget) -> CsiImageResult<()> {
        let Some(info) = self.runtime.snapshot_info(key).await? else {
            tracing::warn!(snapshot = %key, target = %target, "Snapshot already gone");
            return Ok(());
        };

        let mut metadata = info.metadata;
        metadata.remove_target(target);
        if metadata.is_unreferenced() {
            self.runtime.destroy_snapshot(key).await?;
            tracing::debug!(snapshot = %key, "Destroyed unreferenced snapshot");
        } else {
            self.runtime.update_snapshot_metadata(&metadata).await?;
            tracing::debug!(
                snapshot = %key,
                targets = metadata.targets().len(),
                "Dropped snapshot reference"
            );
        }
        Ok(())
    }

    async fn find_snapshot(&self, target: &MountTarget) -> CsiImageResult<Option<SnapshotKey>> {
        let snapshots = self.runtime.list_snapshots().await?;
        let mut matches = snapshots
            .into_iter()
            .filter(|m| m.targets().contains(target))
            .map(|m| m.key().clone());
        let found = matches.next();
        assert!(
            matches.next().is_none(),
            "target {} is referenced by more than one snapshot",
            target
        );
        Ok(found)
    }

    async fn release_lease(&self, target: &MountTarget) {
        if let Err(e) = self.runtime.remove_lease(target).await {
            tracing::error!(target = %target, error = %e, "Failed to release lease");
        }
    }
}
