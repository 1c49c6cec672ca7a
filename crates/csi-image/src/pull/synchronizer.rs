//! Deduplicating pull scheduler.
//!
//! ```text
//! start_pull ──try_send──► [admission queue] ──► dispatcher ──spawn──► pull task
//!     │                                                                   │
//!     └──── joins ◄── active index ◄── reconciler ◄── [completions] ◄─────┘
//! ```
//!
//! One session exists per image while its pull runs. Callers arriving in the
//! meantime join it. When the pull task publishes its outcome it reports the
//! session on the completion queue and the reconciler drops it from the
//! index, so the next request for that image starts fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use csi_image_common::{CsiImageError, CsiImageResult};
use csi_image_remote::Puller;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::session::{PullOutcome, PullSession};

type SessionIndex = Arc<Mutex<HashMap<String, Arc<PullSession>>>>;

/// Deduplicates concurrent pulls of the same image.
pub struct PullSynchronizer {
    sessions: SessionIndex,
    /// Producer side of the admission queue; taken by the reconciler on shutdown.
    requests: Arc<Mutex<Option<mpsc::Sender<Arc<PullSession>>>>>,
    capacity: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PullSynchronizer {
    /// Start the dispatcher and reconciler.
    ///
    /// Cancelling `parent` stops every background task and fails
    /// outstanding waits.
    ///
    /// # Panics
    ///
    /// Panics if `queue_size` is zero or if called outside a tokio runtime.
    #[must_use]
    pub fn new(queue_size: usize, parent: &CancellationToken) -> Self {
        let shutdown = parent.child_token();
        let (request_tx, request_rx) = mpsc::channel(queue_size);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let sessions: SessionIndex = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Some(request_tx)));
        let tasks = TaskTracker::new();

        tasks.spawn(dispatch(
            request_rx,
            completion_tx,
            shutdown.clone(),
            tasks.clone(),
        ));
        tasks.spawn(reconcile(
            completion_rx,
            sessions.clone(),
            requests.clone(),
            shutdown.clone(),
        ));

        tracing::debug!(queue_size, "Pull synchronizer started");

        Self {
            sessions,
            requests,
            capacity: queue_size,
            shutdown,
            tasks,
        }
    }

    /// Join the active pull of `image`, or schedule a new one.
    ///
    /// Never blocks: if the admission queue is full the request is refused
    /// with [`CsiImageError::QueueFull`] and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` on backpressure and `ShuttingDown` after shutdown.
    pub fn start_pull(
        &self,
        image: &str,
        puller: Arc<dyn Puller>,
        timeout: Duration,
    ) -> CsiImageResult<Arc<PullSession>> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(image) {
            tracing::debug!(image, complete = session.is_complete(), "Joining pull session");
            return Ok(session.clone());
        }

        let requests = self.requests.lock();
        let Some(sender) = requests.as_ref() else {
            return Err(self.shutting_down(image));
        };

        let session = Arc::new(PullSession::new(image.to_string(), puller, timeout));
        match sender.try_send(session.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(image, capacity = self.capacity, "Pull queue full");
                return Err(CsiImageError::QueueFull {
                    image: image.to_string(),
                    capacity: self.capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(self.shutting_down(image)),
        }

        sessions.insert(image.to_string(), session.clone());
        tracing::info!(image, timeout_secs = timeout.as_secs(), "Pull session created");
        Ok(session)
    }

    /// Wait for `session` to finish, for at most `timeout`.
    ///
    /// Giving up only affects this caller; the pull keeps running for others.
    ///
    /// # Errors
    ///
    /// Returns the session's terminal error, `WaitTimeout` if the caller's
    /// own timeout fires first, or `ShuttingDown`.
    pub async fn wait_for_pull(
        &self,
        session: &PullSession,
        timeout: Duration,
    ) -> CsiImageResult<()> {
        let started = Instant::now();
        tokio::select! {
            biased;
            () = session.completed() => session.result(),
            () = self.shutdown.cancelled() => Err(self.shutting_down(session.image())),
            () = tokio::time::sleep(timeout) => {
                tracing::debug!(image = session.image(), "Caller stopped waiting for pull");
                Err(CsiImageError::WaitTimeout {
                    operation: format!("pull of {}", session.image()),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Number of sessions currently indexed.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Cancel every background task and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::debug!("Pull synchronizer stopped");
    }

    fn shutting_down(&self, image: &str) -> CsiImageError {
        CsiImageError::ShuttingDown {
            operation: format!("pull of {}", image),
        }
    }
}

impl Drop for PullSynchronizer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(
    mut requests: mpsc::Receiver<Arc<PullSession>>,
    completions: mpsc::UnboundedSender<Arc<PullSession>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let session = tokio::select! {
            () = shutdown.cancelled() => break,
            next = requests.recv() => match next {
                Some(session) => session,
                None => break,
            },
        };

        tasks.spawn(run_pull(session, completions.clone(), shutdown.clone()));
    }

    // Sessions admitted but never dispatched still owe their waiters an outcome.
    requests.close();
    while let Ok(session) = requests.try_recv() {
        session.publish(PullOutcome::Aborted);
    }
    tracing::debug!("Pull dispatcher exited");
}

async fn run_pull(
    session: Arc<PullSession>,
    completions: mpsc::UnboundedSender<Arc<PullSession>>,
    shutdown: CancellationToken,
) {
    let image = session.image().to_string();
    let started = Instant::now();
    tracing::info!(image = %image, "Pull started");

    let outcome = tokio::select! {
        () = shutdown.cancelled() => PullOutcome::Aborted,
        result = tokio::time::timeout(session.timeout(), session.puller().pull()) => match result {
            Ok(Ok(())) => PullOutcome::Succeeded,
            Ok(Err(CsiImageError::PullFailed { message, .. })) => PullOutcome::Failed(message),
            Ok(Err(e)) => PullOutcome::Failed(e.to_string()),
            Err(_) => PullOutcome::TimedOut,
        },
    };

    match &outcome {
        PullOutcome::Succeeded => {
            tracing::info!(image = %image, elapsed_ms = started.elapsed().as_millis(), "Pull finished");
        }
        PullOutcome::TimedOut => {
            tracing::warn!(image = %image, timeout_secs = session.timeout().as_secs(), "Pull timed out");
        }
        PullOutcome::Failed(message) => {
            tracing::error!(image = %image, error = %message, "Pull failed");
        }
        PullOutcome::Aborted => tracing::info!(image = %image, "Pull aborted by shutdown"),
    }

    session.publish(outcome);
    // The reconciler may already be gone during shutdown.
    let _ = completions.send(session);
}

async fn reconcile(
    mut completions: mpsc::UnboundedReceiver<Arc<PullSession>>,
    sessions: SessionIndex,
    requests: Arc<Mutex<Option<mpsc::Sender<Arc<PullSession>>>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = completions.recv() => {
                let Some(session) = next else { break };
                let mut index = sessions.lock();
                if index
                    .get(session.image())
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    index.remove(session.image());
                    tracing::debug!(image = session.image(), "Pull session retired");
                }
            }
        }
    }

    let drained = {
        let mut index = sessions.lock();
        let drained = index.len();
        index.clear();
        drained
    };
    // Dropping the only sender closes the admission queue exactly once.
    requests.lock().take();
    tracing::debug!(drained, "Pull reconciler exited");
}
