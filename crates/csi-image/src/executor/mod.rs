//! Executors turning validated volume requests into pulls and mounts.

mod mount;
mod pull;

pub use mount::{MountExecutor, MountOptions};
pub use pull::{PullExecutor, PullKey, PullOptions};
