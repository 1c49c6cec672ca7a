//! # csi-image-common
//!
//! Shared types for the csi-image node plugin.
//!
//! This crate provides:
//! - The common error type and result alias
//! - Snapshot, image and mount target identifiers
//! - Node configuration
//! - Tracing setup

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod logging;

pub use config::NodeConfig;
pub use error::{CsiImageError, CsiImageResult};
pub use id::{ImageId, LABEL_PREFIX, MountTarget, SnapshotKey};
