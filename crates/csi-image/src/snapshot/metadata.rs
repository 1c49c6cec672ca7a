//! Snapshot metadata and its label encoding.
//!
//! The runtime snapshot itself is the only store: every mount target
//! referencing a snapshot is one label on it.
//!
//! | label | value |
//! |---|---|
//! | `csi-image.warm-metal.tech/target\|<path>` | `true` |
//! | `containerd.io/gc.root` | RFC 3339 creation time |

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use csi_image_common::{LABEL_PREFIX, MountTarget, SnapshotKey};

/// Label keeping the runtime's garbage collector off the snapshot.
pub const GC_ROOT_LABEL: &str = "containerd.io/gc.root";

const TARGET_LABEL_VALUE: &str = "true";

/// Prefix of the per-target labels.
#[must_use]
pub fn target_label_prefix() -> String {
    format!("{}/target|", LABEL_PREFIX)
}

/// A snapshot and the mount targets referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    key: SnapshotKey,
    targets: BTreeSet<MountTarget>,
}

impl SnapshotMetadata {
    /// Metadata for a snapshot with no targets.
    #[must_use]
    pub fn new(key: SnapshotKey) -> Self {
        Self {
            key,
            targets: BTreeSet::new(),
        }
    }

    /// Metadata for a snapshot referenced by one target.
    #[must_use]
    pub fn with_target(key: SnapshotKey, target: MountTarget) -> Self {
        let mut metadata = Self::new(key);
        metadata.targets.insert(target);
        metadata
    }

    /// Snapshot key.
    #[must_use]
    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    /// Targets referencing the snapshot.
    #[must_use]
    pub fn targets(&self) -> &BTreeSet<MountTarget> {
        &self.targets
    }

    /// Add a reference. Returns false if it was already present.
    pub fn add_target(&mut self, target: MountTarget) -> bool {
        self.targets.insert(target)
    }

    /// Drop a reference. Returns false if it was not present.
    pub fn remove_target(&mut self, target: &MountTarget) -> bool {
        self.targets.remove(target)
    }

    /// True when nothing references the snapshot and it may be destroyed.
    #[must_use]
    pub fn is_unreferenced(&self) -> bool {
        self.targets.is_empty()
    }

    /// Encode as runtime labels.
    #[must_use]
    pub fn to_labels(&self, created: DateTime<Utc>) -> BTreeMap<String, String> {
        let prefix = target_label_prefix();
        let mut labels: BTreeMap<String, String> = self
            .targets
            .iter()
            .map(|t| {
                (
                    format!("{}{}", prefix, t.as_path().display()),
                    TARGET_LABEL_VALUE.to_string(),
                )
            })
            .collect();
        labels.insert(
            GC_ROOT_LABEL.to_string(),
            created.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        labels
    }

    /// Decode the labels of snapshot `key`.
    ///
    /// Labels outside the schema are ignored, as are target labels that do
    /// not carry an absolute path.
    pub fn from_labels<'a, I>(key: SnapshotKey, labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let prefix = target_label_prefix();
        let mut metadata = Self::new(key);
        for (name, _) in labels {
            let Some(path) = name.strip_prefix(&prefix) else {
                continue;
            };
            match MountTarget::new(path) {
                Ok(target) => {
                    metadata.targets.insert(target);
                }
                Err(e) => tracing::warn!(
                    snapshot = %metadata.key,
                    label = %name,
                    error = %e,
                    "Ignoring malformed target label"
                ),
            }
        }
        metadata
    }
}

/// True if the labels mark a snapshot managed by this plugin.
pub fn is_owned<'a, I>(labels: I) -> bool
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    labels
        .into_iter()
        .any(|(name, _)| name.starts_with(LABEL_PREFIX))
}
