//! Pull executor: decides whether an image needs pulling and drives the pull.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use csi_image_common::{CsiImageError, CsiImageResult, NodeConfig};
use csi_image_remote::{Credential, ImageReference, ImageService, Keyring, Puller, RemotePuller};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::pull::{PullSession, PullSynchronizer};
use crate::snapshot::SnapshotMounter;
use crate::status::{Status, StatusRecorder};
use crate::volume::VolumeSpec;

/// How often `wait_for_pull` re-reads the pull status.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Slack given to a session past its own timeout before its result is
/// abandoned.
const SESSION_GRACE: Duration = Duration::from_secs(1);

/// Key of the pull status table: one entry per image and pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullKey {
    image: String,
    pod_uid: String,
}

impl PullKey {
    /// Key for `image` pulled on behalf of `pod_uid` (empty if unknown).
    pub fn new(image: &ImageReference, pod_uid: Option<&str>) -> Self {
        Self {
            image: image.full_reference(),
            pod_uid: pod_uid.unwrap_or_default().to_string(),
        }
    }

    /// Full image reference.
    pub fn image(&self) -> &str {
        &self.image
    }
}

impl fmt::Display for PullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pod_uid.is_empty() {
            f.write_str(&self.image)
        } else {
            write!(f, "{}@pod/{}", self.image, self.pod_uid)
        }
    }
}

/// Everything needed to pull one image for one volume.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Image to pull.
    pub image: ImageReference,
    /// Pod the volume is published for.
    pub pod_uid: Option<String>,
    /// Pull even if the runtime already has the image.
    pub pull_always: bool,
    /// Per-request credentials, tried before the keyring's.
    pub credentials: Vec<Credential>,
}

impl PullOptions {
    /// Status key for these options.
    pub fn key(&self) -> PullKey {
        PullKey::new(&self.image, self.pod_uid.as_deref())
    }
}

impl From<&VolumeSpec> for PullOptions {
    fn from(spec: &VolumeSpec) -> Self {
        Self {
            image: spec.image.clone(),
            pod_uid: spec.pod_uid.clone(),
            pull_always: spec.pull_always,
            credentials: Vec::new(),
        }
    }
}

/// Pulls images ahead of mounting them.
///
/// In synchronous mode the pull runs inside `start_pulling`. In asynchronous
/// mode it goes through the [`PullSynchronizer`], which dedups it against
/// other pulls of the same image, and `start_pulling` returns as soon as the
/// pull is admitted.
pub struct PullExecutor {
    mounter: Arc<SnapshotMounter>,
    image_service: Arc<dyn ImageService>,
    keyring: Arc<dyn Keyring>,
    synchronizer: Option<Arc<PullSynchronizer>>,
    status: Arc<StatusRecorder<PullKey>>,
    sessions: Arc<DashMap<PullKey, Arc<PullSession>>>,
    errors: Arc<DashMap<PullKey, String>>,
    timeout: Duration,
}

impl PullExecutor {
    /// Create an executor; pass a synchronizer to pull asynchronously.
    pub fn new(
        mounter: Arc<SnapshotMounter>,
        image_service: Arc<dyn ImageService>,
        keyring: Arc<dyn Keyring>,
        status: Arc<StatusRecorder<PullKey>>,
        synchronizer: Option<Arc<PullSynchronizer>>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            mounter,
            image_service,
            keyring,
            synchronizer,
            status,
            sessions: Arc::new(DashMap::new()),
            errors: Arc::new(DashMap::new()),
            timeout: config.pull_timeout(),
        }
    }

    /// Shared pull status table.
    pub fn status(&self) -> &Arc<StatusRecorder<PullKey>> {
        &self.status
    }

    /// Make sure the image of `opts` is present in the runtime.
    ///
    /// Does nothing if a pull for the same key is already running or done.
    ///
    /// # Errors
    ///
    /// In synchronous mode returns the pull error. In asynchronous mode only
    /// admission errors (`QueueFull`, `ShuttingDown`) are returned here;
    /// everything else is reported through [`Self::wait_for_pull`].
    pub async fn start_pulling(&self, opts: &PullOptions) -> CsiImageResult<()> {
        let key = opts.key();
        let Some(previous) = self.status.begin(&key) else {
            tracing::debug!(key = %key, "Pull already started");
            return Ok(());
        };
        self.errors.remove(&key);

        if !opts.pull_always && self.mounter.image_exists(key.image()).await {
            tracing::debug!(key = %key, "Image present, skipping pull");
            self.status.update(&key, Status::Processed);
            return Ok(());
        }

        let puller: Arc<dyn Puller> = Arc::new(
            RemotePuller::new(self.image_service.clone(), opts.image.clone(), self.keyring.as_ref())
                .with_extra_credentials(opts.credentials.clone()),
        );
        tracing::info!(key = %key, %previous, pull_always = opts.pull_always, "Pulling image");

        match &self.synchronizer {
            None => {
                let result = match tokio::time::timeout(self.timeout, puller.pull()).await {
                    Ok(result) => result,
                    Err(_) => Err(CsiImageError::PullTimedOut {
                        image: key.image().to_string(),
                        timeout_secs: self.timeout.as_secs(),
                    }),
                };
                record(&self.status, &self.errors, &key, result.as_ref().err());
                result
            }
            Some(synchronizer) => {
                let session = match synchronizer.start_pull(key.image(), puller, self.timeout) {
                    Ok(session) => session,
                    Err(e) => {
                        record(&self.status, &self.errors, &key, Some(&e));
                        return Err(e);
                    }
                };
                self.sessions.insert(key.clone(), session.clone());

                let synchronizer = synchronizer.clone();
                let status = self.status.clone();
                let errors = self.errors.clone();
                let sessions = self.sessions.clone();
                let timeout = self.timeout + SESSION_GRACE;
                tokio::spawn(async move {
                    let result = synchronizer.wait_for_pull(&session, timeout).await;
                    record(&status, &errors, &key, result.as_ref().err());
                    sessions.remove_if(&key, |_, s| Arc::ptr_eq(s, &session));
                });
                Ok(())
            }
        }
    }

    /// Wait up to `timeout` for the pull of `opts` to finish.
    ///
    /// # Errors
    ///
    /// Returns the recorded pull error, `FailedPrecondition` if no pull was
    /// started, or `WaitTimeout`.
    pub async fn wait_for_pull(&self, opts: &PullOptions, timeout: Duration) -> CsiImageResult<()> {
        let key = opts.key();
        let deadline = Instant::now() + timeout;

        loop {
            match self.status.get(&key) {
                Status::Processed => return Ok(()),
                Status::Errored => return Err(self.recorded_error(&key)),
                Status::NotFound => {
                    return Err(CsiImageError::FailedPrecondition {
                        message: format!("no pull started for {key}"),
                    });
                }
                Status::StillProcessing => {}
            }

            let session = self.sessions.get(&key).map(|s| s.value().clone());
            if let (Some(session), Some(synchronizer)) = (session, &self.synchronizer) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = synchronizer.wait_for_pull(&session, remaining).await;
                // The session finished: make its outcome visible before returning.
                if !matches!(result, Err(CsiImageError::WaitTimeout { .. })) {
                    record(&self.status, &self.errors, &key, result.as_ref().err());
                }
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CsiImageError::WaitTimeout {
                    operation: format!("pull of {key}"),
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Drop everything recorded for `key`.
    pub fn forget(&self, key: &PullKey) {
        self.status.delete(key);
        self.errors.remove(key);
        self.sessions.remove(key);
        tracing::debug!(key = %key, "Pull status forgotten");
    }

    fn recorded_error(&self, key: &PullKey) -> CsiImageError {
        let message = self
            .errors
            .get(key)
            .map_or_else(|| "pull failed".to_string(), |e| e.value().clone());
        CsiImageError::PullFailed {
            image: key.image().to_string(),
            message,
        }
    }
}

fn record(
    status: &StatusRecorder<PullKey>,
    errors: &DashMap<PullKey, String>,
    key: &PullKey,
    error: Option<&CsiImageError>,
) {
    let settled = if error.is_some() { Status::Errored } else { Status::Processed };
    // Both the caller's wait and the session watcher record the outcome.
    if !status.complete(key, settled) {
        return;
    }
    match error {
        None => {
            errors.remove(key);
            tracing::info!(key = %key, "Image pulled");
        }
        Some(e) => {
            errors.insert(key.clone(), e.to_string());
            tracing::error!(key = %key, error = %e, "Image pull failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_key_includes_pod() {
        let image = ImageReference::parse("alpine:3.19").unwrap();
        let anonymous = PullKey::new(&image, None);
        let pod = PullKey::new(&image, Some("8d3c"));

        assert_eq!(anonymous.to_string(), "docker.io/library/alpine:3.19");
        assert_eq!(pod.to_string(), "docker.io/library/alpine:3.19@pod/8d3c");
        assert_ne!(anonymous, pod);
        assert_eq!(pod.image(), anonymous.image());
    }
}
