//! # csi-image-remote
//!
//! Remote image access for the csi-image node plugin.
//!
//! This crate provides:
//! - Image reference parsing
//! - Registry credentials and keyrings
//! - The pull capability consumed by the pull synchronizer

#![warn(missing_docs)]

pub mod credentials;
pub mod puller;
pub mod reference;

pub use credentials::{Credential, DockerConfigKeyring, Keyring, StaticKeyring};
pub use puller::{ImageService, Puller, RemotePuller};
pub use reference::{ImageReference, ImageTag};
