//! A single tracked pull of one image reference.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use csi_image_common::{CsiImageError, CsiImageResult};
use csi_image_remote::Puller;
use tokio::sync::watch;

/// Terminal state of a pull session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The image is in the runtime.
    Succeeded,
    /// The pull ran past the session timeout.
    TimedOut,
    /// The pull failed.
    Failed(String),
    /// The node shut down before the pull finished.
    Aborted,
}

/// One in-flight or completed pull, shared by every caller that joined it.
///
/// The outcome is a single-assignment cell: only the dispatch task writes it,
/// once, before flipping the completion latch. Readers never see a partially
/// published session.
pub struct PullSession {
    image: String,
    puller: Arc<dyn Puller>,
    timeout: Duration,
    outcome: OnceLock<PullOutcome>,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for PullSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSession")
            .field("image", &self.image)
            .field("timeout", &self.timeout)
            .field("outcome", &self.outcome.get())
            .finish_non_exhaustive()
    }
}

impl PullSession {
    pub(crate) fn new(image: String, puller: Arc<dyn Puller>, timeout: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            image,
            puller,
            timeout,
            outcome: OnceLock::new(),
            done,
        }
    }

    /// Image reference being pulled.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// How long the pull itself may run.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn puller(&self) -> &Arc<dyn Puller> {
        &self.puller
    }

    /// True once a terminal outcome is published.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// True if the pull ran past its session timeout.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self.outcome.get(), Some(PullOutcome::TimedOut))
    }

    /// The published outcome, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<&PullOutcome> {
        self.outcome.get()
    }

    /// Terminal error of a completed session; `None` on success or while running.
    #[must_use]
    pub fn error(&self) -> Option<CsiImageError> {
        match self.outcome.get()? {
            PullOutcome::Succeeded => None,
            PullOutcome::TimedOut => Some(CsiImageError::PullTimedOut {
                image: self.image.clone(),
                timeout_secs: self.timeout.as_secs(),
            }),
            PullOutcome::Failed(message) => Some(CsiImageError::PullFailed {
                image: self.image.clone(),
                message: message.clone(),
            }),
            PullOutcome::Aborted => Some(CsiImageError::ShuttingDown {
                operation: format!("pull of {}", self.image),
            }),
        }
    }

    pub(crate) fn result(&self) -> CsiImageResult<()> {
        self.error().map_or(Ok(()), Err)
    }

    /// Publish the outcome and release every waiter.
    ///
    /// # Panics
    ///
    /// Panics if an outcome was already published; only the dispatch task
    /// owning the session may publish.
    pub(crate) fn publish(&self, outcome: PullOutcome) {
        if self.outcome.set(outcome).is_err() {
            panic!("pull session for {} published twice", self.image);
        }
        self.done.send_replace(true);
    }

    /// Resolve once the outcome is published.
    pub(crate) async fn completed(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Puller for Noop {
        async fn pull(&self) -> CsiImageResult<()> {
            Ok(())
        }
    }

    fn session() -> PullSession {
        PullSession::new("alpine".into(), Arc::new(Noop), Duration::from_secs(5))
    }

    #[test]
    fn running_session_has_no_error() {
        let session = session();
        assert!(!session.is_complete());
        assert!(session.error().is_none());
    }

    #[test]
    fn timed_out_is_flagged() {
        let session = session();
        session.publish(PullOutcome::TimedOut);
        assert!(session.is_complete());
        assert!(session.is_timed_out());
        assert!(session.error().unwrap().is_timeout());
    }

    #[test]
    fn failed_carries_message() {
        let session = session();
        session.publish(PullOutcome::Failed("manifest unknown".into()));
        assert!(!session.is_timed_out());
        let err = session.result().unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
    }

    #[test]
    #[should_panic(expected = "published twice")]
    fn publish_is_single_assignment() {
        let session = session();
        session.publish(PullOutcome::Succeeded);
        session.publish(PullOutcome::Aborted);
    }

    #[tokio::test]
    async fn completed_resolves_after_publish() {
        let session = Arc::new(session());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.completed().await })
        };
        session.publish(PullOutcome::Succeeded);
        waiter.await.unwrap();
        // Late waiters resolve immediately.
        session.completed().await;
    }
}
