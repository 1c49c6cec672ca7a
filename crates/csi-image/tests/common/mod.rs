//! In-memory runtime and registry shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use csi_image::snapshot::{ContainerRuntimeMounter, SnapshotInfo, SnapshotKind, SnapshotMetadata, is_owned};
use csi_image_common::{CsiImageError, CsiImageResult, ImageId, MountTarget, SnapshotKey};
use csi_image_remote::{Credential, ImageReference, ImageService};
use parking_lot::Mutex;

struct StoredSnapshot {
    parent: ImageId,
    kind: SnapshotKind,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    images: HashMap<String, ImageId>,
    snapshots: BTreeMap<SnapshotKey, StoredSnapshot>,
    leases: BTreeSet<MountTarget>,
    released: Vec<MountTarget>,
    mounted: BTreeSet<MountTarget>,
}

/// A runtime that keeps snapshots as label maps, the way containerd does.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    fail_mount: AtomicBool,
    pub mount_calls: AtomicUsize,
    pub mount_table_reads: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `image` present, identified by `id`.
    pub fn add_image(&self, image: &str, id: &str) {
        self.state
            .lock()
            .images
            .insert(normalize(image), ImageId::new(id));
    }

    /// Seed a snapshot as if left behind by a previous run.
    pub fn seed_snapshot(&self, metadata: &SnapshotMetadata, parent: &str, kind: SnapshotKind) {
        let mut state = self.state.lock();
        for target in metadata.targets() {
            state.leases.insert(target.clone());
        }
        state.snapshots.insert(
            metadata.key().clone(),
            StoredSnapshot {
                parent: ImageId::new(parent),
                kind,
                labels: metadata.to_labels(Utc::now()),
            },
        );
    }

    /// Pretend `target` is still mounted.
    pub fn mark_mounted(&self, target: &MountTarget) {
        self.state.lock().mounted.insert(target.clone());
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_keys(&self) -> Vec<SnapshotKey> {
        self.state.lock().snapshots.keys().cloned().collect()
    }

    pub fn targets_of(&self, key: &SnapshotKey) -> Vec<MountTarget> {
        self.state
            .lock()
            .snapshots
            .get(key)
            .map(|s| decode(key, &s.labels).targets().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn labels_of(&self, key: &SnapshotKey) -> Option<BTreeMap<String, String>> {
        self.state.lock().snapshots.get(key).map(|s| s.labels.clone())
    }

    pub fn leases(&self) -> Vec<MountTarget> {
        self.state.lock().leases.iter().cloned().collect()
    }

    pub fn released_leases(&self) -> Vec<MountTarget> {
        self.state.lock().released.clone()
    }

    pub fn mounted(&self) -> Vec<MountTarget> {
        self.state.lock().mounted.iter().cloned().collect()
    }
}

fn normalize(image: &str) -> String {
    ImageReference::parse(image).map_or_else(|_| image.to_string(), |r| r.full_reference())
}

fn decode(key: &SnapshotKey, labels: &BTreeMap<String, String>) -> SnapshotMetadata {
    SnapshotMetadata::from_labels(key.clone(), labels)
}

#[async_trait]
impl ContainerRuntimeMounter for FakeRuntime {
    async fn mount(&self, key: &SnapshotKey, target: &MountTarget, _read_only: bool) -> CsiImageResult<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(CsiImageError::runtime("mount", "bind mount refused"));
        }
        let mut state = self.state.lock();
        if !state.snapshots.contains_key(key) {
            return Err(CsiImageError::SnapshotNotFound { key: key.to_string() });
        }
        state.mounted.insert(target.clone());
        Ok(())
    }

    async fn unmount(&self, target: &MountTarget) -> CsiImageResult<()> {
        self.state.lock().mounted.remove(target);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.state.lock().images.contains_key(&normalize(image))
    }

    async fn image_id(&self, image: &str) -> CsiImageResult<ImageId> {
        self.state
            .lock()
            .images
            .get(&normalize(image))
            .cloned()
            .ok_or_else(|| CsiImageError::ImageNotFound {
                reference: image.to_string(),
            })
    }

    async fn prepare_read_only_snapshot(&self, parent: &ImageId, metadata: &SnapshotMetadata) -> CsiImageResult<()> {
        self.prepare(parent, metadata, SnapshotKind::ReadOnly)
    }

    async fn prepare_rw_snapshot(&self, parent: &ImageId, metadata: &SnapshotMetadata) -> CsiImageResult<()> {
        self.prepare(parent, metadata, SnapshotKind::ReadWrite)
    }

    async fn update_snapshot_metadata(&self, metadata: &SnapshotMetadata) -> CsiImageResult<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .snapshots
            .get_mut(metadata.key())
            .ok_or_else(|| CsiImageError::SnapshotNotFound {
                key: metadata.key().to_string(),
            })?;
        snapshot.labels = metadata.to_labels(Utc::now());
        Ok(())
    }

    async fn destroy_snapshot(&self, key: &SnapshotKey) -> CsiImageResult<()> {
        self.state
            .lock()
            .snapshots
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| CsiImageError::SnapshotNotFound { key: key.to_string() })
    }

    async fn snapshot_info(&self, key: &SnapshotKey) -> CsiImageResult<Option<SnapshotInfo>> {
        Ok(self.state.lock().snapshots.get(key).map(|s| SnapshotInfo {
            metadata: decode(key, &s.labels),
            parent: s.parent.clone(),
            kind: s.kind,
        }))
    }

    async fn list_snapshots(&self) -> CsiImageResult<Vec<SnapshotMetadata>> {
        Ok(self
            .state
            .lock()
            .snapshots
            .iter()
            .filter(|(_, s)| is_owned(&s.labels))
            .map(|(key, s)| decode(key, &s.labels))
            .collect())
    }

    async fn add_lease(&self, target: &MountTarget) -> CsiImageResult<()> {
        self.state.lock().leases.insert(target.clone());
        Ok(())
    }

    async fn remove_lease(&self, target: &MountTarget) -> CsiImageResult<()> {
        let mut state = self.state.lock();
        state.leases.remove(target);
        state.released.push(target.clone());
        Ok(())
    }

    async fn mount_table(&self) -> CsiImageResult<HashSet<PathBuf>> {
        self.mount_table_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .mounted
            .iter()
            .map(|t| t.as_path().to_path_buf())
            .collect())
    }
}

impl FakeRuntime {
    fn prepare(&self, parent: &ImageId, metadata: &SnapshotMetadata, kind: SnapshotKind) -> CsiImageResult<()> {
        let mut state = self.state.lock();
        if state.snapshots.contains_key(metadata.key()) {
            return Err(CsiImageError::runtime(
                "prepare snapshot",
                format!("snapshot {} already exists", metadata.key()),
            ));
        }
        state.snapshots.insert(
            metadata.key().clone(),
            StoredSnapshot {
                parent: parent.clone(),
                kind,
                labels: metadata.to_labels(Utc::now()),
            },
        );
        Ok(())
    }
}

/// A registry that takes `delay` per pull and makes the image present in
/// `runtime` on success.
pub struct FakeRegistry {
    runtime: Arc<FakeRuntime>,
    delay: Duration,
    fail: AtomicBool,
    pub pulls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(runtime: Arc<FakeRuntime>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            delay,
            fail: AtomicBool::new(false),
            pulls: AtomicUsize::new(0),
        })
    }

    pub fn fail_pulls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageService for FakeRegistry {
    async fn pull_image(&self, image: &ImageReference, _credential: Option<&Credential>) -> CsiImageResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(CsiImageError::runtime("pull", "manifest unknown"));
        }
        let reference = image.full_reference();
        let id = format!("sha256:{}", reference.replace(['/', ':', '.'], ""));
        self.runtime.add_image(&reference, &id);
        Ok(())
    }
}

pub fn target(path: &str) -> MountTarget {
    MountTarget::new(path).unwrap()
}
