//! Image pull deduplication.

mod session;
mod synchronizer;

pub use session::{PullOutcome, PullSession};
pub use synchronizer::PullSynchronizer;
