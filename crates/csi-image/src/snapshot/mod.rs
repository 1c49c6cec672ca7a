//! Runtime snapshots backing image volumes.

pub mod metadata;
mod mounter;
mod ratelimit;
mod runtime;

pub use metadata::{GC_ROOT_LABEL, SnapshotMetadata, is_owned, target_label_prefix};
pub use mounter::SnapshotMounter;
pub use ratelimit::RateLimiter;
pub use runtime::{ContainerRuntimeMounter, SnapshotInfo, SnapshotKind};
