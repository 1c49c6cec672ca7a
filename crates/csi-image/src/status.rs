//! Per-key lifecycle status of pulls and mounts.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::RwLock;

/// Where a pull or mount currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The last attempt failed; a new attempt may start.
    Errored,
    /// Nothing is known about the key.
    NotFound,
    /// An attempt is in progress.
    StillProcessing,
    /// The attempt succeeded.
    Processed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Errored => write!(f, "errored"),
            Status::NotFound => write!(f, "not-found"),
            Status::StillProcessing => write!(f, "still-processing"),
            Status::Processed => write!(f, "processed"),
        }
    }
}

/// Thread-safe map from key to [`Status`].
///
/// Unknown keys read as [`Status::NotFound`], which is never stored.
#[derive(Debug)]
pub struct StatusRecorder<K> {
    states: RwLock<HashMap<K, Status>>,
}

impl<K> Default for StatusRecorder<K> {
    fn default() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Display> StatusRecorder<K> {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of `key`.
    pub fn get(&self, key: &K) -> Status {
        self.states
            .read()
            .get(key)
            .copied()
            .unwrap_or(Status::NotFound)
    }

    /// Record `status` for `key`. Recording `NotFound` forgets the key.
    pub fn update(&self, key: &K, status: Status) {
        tracing::trace!(key = %key, %status, "Status updated");
        let mut states = self.states.write();
        if status == Status::NotFound {
            states.remove(key);
        } else {
            states.insert(key.clone(), status);
        }
    }

    /// Forget `key`.
    pub fn delete(&self, key: &K) {
        self.states.write().remove(key);
    }

    /// Move `key` to `StillProcessing` unless an attempt is running or done.
    ///
    /// Returns the previous status when the transition happened.
    pub fn begin(&self, key: &K) -> Option<Status> {
        let mut states = self.states.write();
        let previous = states.get(key).copied().unwrap_or(Status::NotFound);
        match previous {
            Status::StillProcessing | Status::Processed => None,
            Status::NotFound | Status::Errored => {
                states.insert(key.clone(), Status::StillProcessing);
                Some(previous)
            }
        }
    }

    /// Settle an attempt started with [`Self::begin`].
    ///
    /// Returns false, leaving the key alone, if no attempt is in progress:
    /// the attempt was already settled or the key was forgotten meanwhile.
    pub fn complete(&self, key: &K, status: Status) -> bool {
        let mut states = self.states.write();
        match states.get_mut(key) {
            Some(current) if *current == Status::StillProcessing => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    /// Number of keys with a recorded status.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// True if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_not_found() {
        let recorder: StatusRecorder<String> = StatusRecorder::new();
        assert_eq!(recorder.get(&"nginx".to_string()), Status::NotFound);
        assert!(recorder.is_empty());
    }

    #[test]
    fn update_and_delete() {
        let recorder = StatusRecorder::new();
        let key = "/var/lib/kubelet/target".to_string();

        recorder.update(&key, Status::StillProcessing);
        assert_eq!(recorder.get(&key), Status::StillProcessing);

        recorder.update(&key, Status::Processed);
        assert_eq!(recorder.get(&key), Status::Processed);

        recorder.delete(&key);
        assert_eq!(recorder.get(&key), Status::NotFound);
        assert!(recorder.is_empty());
    }

    #[test]
    fn not_found_is_never_stored() {
        let recorder = StatusRecorder::new();
        let key = "alpine".to_string();
        recorder.update(&key, Status::Errored);
        recorder.update(&key, Status::NotFound);
        assert_eq!(recorder.len(), 0);
    }

    #[test]
    fn complete_only_settles_running_attempts() {
        let recorder = StatusRecorder::new();
        let key = "alpine".to_string();

        assert!(!recorder.complete(&key, Status::Processed));
        assert!(recorder.is_empty());

        recorder.begin(&key);
        assert!(recorder.complete(&key, Status::Processed));
        assert!(!recorder.complete(&key, Status::Errored));
        assert_eq!(recorder.get(&key), Status::Processed);

        recorder.begin(&key);
        recorder.delete(&key);
        assert!(!recorder.complete(&key, Status::Errored));
        assert_eq!(recorder.get(&key), Status::NotFound);
    }

    #[test]
    fn begin_follows_state_machine() {
        let recorder = StatusRecorder::new();
        let key = "alpine".to_string();

        assert_eq!(recorder.begin(&key), Some(Status::NotFound));
        assert_eq!(recorder.begin(&key), None);

        recorder.update(&key, Status::Errored);
        assert_eq!(recorder.begin(&key), Some(Status::Errored));

        recorder.update(&key, Status::Processed);
        assert_eq!(recorder.begin(&key), None);
        assert_eq!(recorder.get(&key), Status::Processed);
    }
}
