//! Mount executor: serializes mount work per target and tracks its status.

use std::sync::Arc;
use std::time::Duration;

use csi_image_common::{CsiImageError, CsiImageResult, MountTarget};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::pull::PullKey;
use crate::snapshot::SnapshotMounter;
use crate::status::{Status, StatusRecorder};
use crate::volume::VolumeSpec;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

type LockTable = DashMap<MountTarget, Arc<Mutex<()>>>;

/// One mount request.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Volume ID.
    pub volume_id: String,
    /// Where to mount.
    pub target: MountTarget,
    /// Pull that must have completed first.
    pub pull: PullKey,
    /// Share the image's read-only snapshot.
    pub read_only: bool,
}

impl From<&VolumeSpec> for MountOptions {
    fn from(spec: &VolumeSpec) -> Self {
        Self {
            volume_id: spec.volume_id.clone(),
            target: spec.target.clone(),
            pull: PullKey::new(&spec.image, spec.pod_uid.as_deref()),
            read_only: spec.read_only,
        }
    }
}

/// Drives the [`SnapshotMounter`] for publish and unpublish requests.
pub struct MountExecutor {
    mounter: Arc<SnapshotMounter>,
    pull_status: Arc<StatusRecorder<PullKey>>,
    status: Arc<StatusRecorder<MountTarget>>,
    locks: Arc<LockTable>,
    errors: Arc<DashMap<MountTarget, String>>,
    async_mount: bool,
}

impl MountExecutor {
    /// Create an executor gated on `pull_status`.
    pub fn new(
        mounter: Arc<SnapshotMounter>,
        pull_status: Arc<StatusRecorder<PullKey>>,
        async_mount: bool,
    ) -> Self {
        Self {
            mounter,
            pull_status,
            status: Arc::new(StatusRecorder::new()),
            locks: Arc::new(DashMap::new()),
            errors: Arc::new(DashMap::new()),
            async_mount,
        }
    }

    /// Current mount status of `target`.
    pub fn status(&self, target: &MountTarget) -> Status {
        self.status.get(target)
    }

    /// Number of targets with a lock entry.
    pub fn locked_targets(&self) -> usize {
        self.locks.len()
    }

    /// Last mount or unmount error recorded for `target`.
    pub fn last_error(&self, target: &MountTarget) -> Option<String> {
        self.errors.get(target).map(|e| e.value().clone())
    }

    /// Mount the pulled image of `opts` on its target.
    ///
    /// Repeated calls for a target that is mounted or being mounted succeed
    /// without doing anything. With async mounts enabled the mount runs in
    /// the background; use [`Self::wait_for_mount`] to observe it.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the image has not been pulled, or the
    /// mount error in synchronous mode.
    pub async fn start_mounting(&self, opts: &MountOptions) -> CsiImageResult<()> {
        let pulled = self.pull_status.get(&opts.pull);
        if pulled != Status::Processed {
            return Err(CsiImageError::FailedPrecondition {
                message: format!("image {} is not pulled yet ({pulled})", opts.pull),
            });
        }

        let guard = self.lock_for(&opts.target).lock_owned().await;
        if self.status.begin(&opts.target).is_none() {
            tracing::debug!(target = %opts.target, "Mount already started");
            return Ok(());
        }
        self.errors.remove(&opts.target);

        if self.async_mount {
            let mounter = self.mounter.clone();
            let status = self.status.clone();
            let errors = self.errors.clone();
            let locks = self.locks.clone();
            let opts = opts.clone();
            tokio::spawn(async move {
                let result = mounter
                    .mount(&opts.volume_id, &opts.target, opts.pull.image(), opts.read_only)
                    .await;
                record(&status, &errors, &opts.target, result.as_ref().err());
                drop(guard);
                if result.is_err() {
                    prune_lock(&locks, &opts.target);
                }
            });
            return Ok(());
        }

        let result = self
            .mounter
            .mount(&opts.volume_id, &opts.target, opts.pull.image(), opts.read_only)
            .await;
        record(&self.status, &self.errors, &opts.target, result.as_ref().err());
        drop(guard);
        if result.is_err() {
            prune_lock(&self.locks, &opts.target);
        }
        result
    }

    /// Wait up to `timeout` for the mount of `target` to finish.
    ///
    /// # Errors
    ///
    /// Returns the recorded mount error, `FailedPrecondition` if no mount was
    /// started, or `WaitTimeout`.
    pub async fn wait_for_mount(&self, target: &MountTarget, timeout: Duration) -> CsiImageResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status.get(target) {
                Status::Processed => return Ok(()),
                Status::Errored => {
                    let message = self
                        .last_error(target)
                        .unwrap_or_else(|| "mount failed".to_string());
                    return Err(CsiImageError::runtime("mount", message));
                }
                Status::NotFound => {
                    return Err(CsiImageError::FailedPrecondition {
                        message: format!("no mount started for {target}"),
                    });
                }
                Status::StillProcessing => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CsiImageError::WaitTimeout {
                    operation: format!("mount of {target}"),
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Unmount `target` and forget its status.
    ///
    /// # Errors
    ///
    /// Returns the unmount error; it is also kept as the target's last error.
    pub async fn start_unmounting(&self, volume_id: &str, target: &MountTarget) -> CsiImageResult<()> {
        let lock = self.lock_for(target);
        let guard = lock.lock().await;

        let result = self.mounter.unmount(volume_id, target).await;
        match &result {
            Ok(()) => {
                self.status.delete(target);
                self.errors.remove(target);
            }
            Err(e) => {
                tracing::error!(volume_id, target = %target, error = %e, "Unmount failed");
                self.errors.insert(target.clone(), e.to_string());
            }
        }

        drop(guard);
        drop(lock);
        if result.is_ok() {
            prune_lock(&self.locks, target);
        }
        result
    }

    fn lock_for(&self, target: &MountTarget) -> Arc<Mutex<()>> {
        self.locks
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

/// Drop the lock of `target` unless someone still holds or waits on it.
fn prune_lock(locks: &LockTable, target: &MountTarget) {
    locks.remove_if(target, |_, lock| Arc::strong_count(lock) == 1);
}

fn record(
    status: &StatusRecorder<MountTarget>,
    errors: &DashMap<MountTarget, String>,
    target: &MountTarget,
    error: Option<&CsiImageError>,
) {
    match error {
        None => status.update(target, Status::Processed),
        Some(e) => {
            tracing::error!(target = %target, error = %e, "Mount failed");
            errors.insert(target.clone(), e.to_string());
            status.update(target, Status::Errored);
        }
    }
}
