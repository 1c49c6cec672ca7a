//! # csi-image
//!
//! Node-side core of a CSI driver that mounts container images as volumes.
//!
//! Images are never unpacked here. The container runtime already keeps
//! them in a content-addressed snapshot store, so a volume is a snapshot of
//! the image's rootfs bind-mounted on the target path.
//!
//! This crate provides:
//! - A pull synchronizer that dedups concurrent pulls of the same image
//! - A snapshot mounter sharing read-only snapshots between targets
//! - Pull and mount executors with per-key status tracking
//! - Validation of publish/unpublish requests

#![warn(missing_docs)]

pub mod executor;
pub mod mounts;
pub mod node;
pub mod pull;
pub mod snapshot;
pub mod status;
pub mod volume;

pub use executor::{MountExecutor, MountOptions, PullExecutor, PullKey, PullOptions};
pub use node::NodeService;
pub use pull::{PullOutcome, PullSession, PullSynchronizer};
pub use snapshot::{ContainerRuntimeMounter, SnapshotInfo, SnapshotKind, SnapshotMetadata, SnapshotMounter};
pub use status::{Status, StatusRecorder};
pub use volume::{AccessMode, PublishRequest, VolumeSpec};
