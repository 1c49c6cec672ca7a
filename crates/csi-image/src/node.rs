//! Node service wiring.
//!
//! [`NodeService`] owns one instance of every component and implements the
//! publish and unpublish flows on top of them:
//!
//! ```text
//! publish:   validate → PullExecutor (→ PullSynchronizer) → MountExecutor → SnapshotMounter
//! unpublish: validate → MountExecutor → SnapshotMounter (unbind, unref or destroy)
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use csi_image_common::{CsiImageResult, MountTarget, NodeConfig};
use csi_image_remote::{Credential, ImageService, Keyring};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::executor::{MountExecutor, MountOptions, PullExecutor, PullKey, PullOptions};
use crate::pull::PullSynchronizer;
use crate::snapshot::{ContainerRuntimeMounter, SnapshotMounter};
use crate::status::StatusRecorder;
use crate::volume::{PublishRequest, validate_unpublish};

/// The node plugin core.
pub struct NodeService {
    mounter: Arc<SnapshotMounter>,
    pulls: PullExecutor,
    mounts: MountExecutor,
    synchronizer: Option<Arc<PullSynchronizer>>,
    /// Pull each published target depends on, forgotten on unpublish.
    published: DashMap<MountTarget, PullKey>,
    wait_timeout: Duration,
}

impl NodeService {
    /// Validate `config`, reconcile the runtime's snapshots and start the
    /// background tasks.
    ///
    /// Cancelling `shutdown` stops them; [`Self::shutdown`] also waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the runtime's
    /// snapshots cannot be listed.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntimeMounter>,
        image_service: Arc<dyn ImageService>,
        keyring: Arc<dyn Keyring>,
        config: &NodeConfig,
        shutdown: &CancellationToken,
    ) -> CsiImageResult<Self> {
        config.validate()?;

        let mounter = Arc::new(SnapshotMounter::new(runtime, config).await?);
        let synchronizer = config
            .async_pull
            .then(|| Arc::new(PullSynchronizer::new(config.pull_queue_size, shutdown)));
        let pull_status = Arc::new(StatusRecorder::new());

        let pulls = PullExecutor::new(
            mounter.clone(),
            image_service,
            keyring,
            pull_status.clone(),
            synchronizer.clone(),
            config,
        );
        let mounts = MountExecutor::new(mounter.clone(), pull_status, config.async_mount);

        tracing::info!(
            async_pull = config.async_pull,
            async_mount = config.async_mount,
            pull_timeout_secs = config.async_pull_timeout,
            "Node service started"
        );

        Ok(Self {
            mounter,
            pulls,
            mounts,
            synchronizer,
            published: DashMap::new(),
            wait_timeout: config.pull_timeout(),
        })
    }

    /// Pull and mount the image volume described by `request`.
    ///
    /// `credentials` come from the request's secrets and are tried before
    /// the node keyring.
    ///
    /// # Errors
    ///
    /// Returns validation, pull or mount errors.
    pub async fn publish(&self, request: &PublishRequest, credentials: &[Credential]) -> CsiImageResult<()> {
        let spec = request.validate()?;
        tracing::debug!(
            volume_id = %spec.volume_id,
            target = %spec.target,
            image = %spec.image,
            read_only = spec.read_only,
            "Publishing volume"
        );

        let mut pull = PullOptions::from(&spec);
        pull.credentials = credentials.to_vec();
        self.published.insert(spec.target.clone(), pull.key());
        self.pulls.start_pulling(&pull).await?;
        self.pulls.wait_for_pull(&pull, self.wait_timeout).await?;

        let mount = MountOptions::from(&spec);
        self.mounts.start_mounting(&mount).await?;
        self.mounts.wait_for_mount(&mount.target, self.wait_timeout).await
    }

    /// Unmount the volume at `target_path`.
    ///
    /// Once no published target depends on its pull any more, the pull's
    /// status is forgotten too.
    ///
    /// # Errors
    ///
    /// Returns validation or unmount errors.
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> CsiImageResult<()> {
        let target = validate_unpublish(volume_id, target_path)?;
        tracing::debug!(volume_id, target = %target, "Unpublishing volume");
        self.mounts.start_unmounting(volume_id, &target).await?;

        if let Some((_, key)) = self.published.remove(&target) {
            let shared = self.published.iter().any(|entry| *entry.value() == key);
            if !shared {
                self.pulls.forget(&key);
            }
        }
        Ok(())
    }

    /// The pull executor.
    pub fn pulls(&self) -> &PullExecutor {
        &self.pulls
    }

    /// The mount executor.
    pub fn mounts(&self) -> &MountExecutor {
        &self.mounts
    }

    /// The snapshot mounter.
    pub fn mounter(&self) -> &Arc<SnapshotMounter> {
        &self.mounter
    }

    /// Stop the pull synchronizer and wait for its tasks.
    pub async fn shutdown(&self) {
        if let Some(synchronizer) = &self.synchronizer {
            synchronizer.shutdown().await;
        }
        tracing::info!("Node service stopped");
    }
}
