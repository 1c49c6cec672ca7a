//! Common error types for the csi-image node plugin.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CsiImageError`].
pub type CsiImageResult<T> = Result<T, CsiImageError>;

/// Errors produced by the pull and mount machinery.
#[derive(Error, Diagnostic, Debug)]
pub enum CsiImageError {
    /// A request was missing a required field or carried a malformed one.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(csi_image::request::invalid_argument))]
    InvalidArgument {
        /// What was wrong with the request.
        message: String,
    },

    /// The pull admission queue is full.
    #[error("Pull queue is full ({capacity} outstanding), refusing to pull {image}")]
    #[diagnostic(
        code(csi_image::pull::queue_full),
        help("Retry later or raise `pull_queue_size` in the node configuration")
    )]
    QueueFull {
        /// Image whose pull was refused.
        image: String,
        /// Capacity of the admission queue.
        capacity: usize,
    },

    /// A request arrived before the state it depends on was reached.
    #[error("Failed precondition: {message}")]
    #[diagnostic(code(csi_image::request::failed_precondition))]
    FailedPrecondition {
        /// Which precondition was not met.
        message: String,
    },

    /// The pull itself ran past its session timeout.
    #[error("Pull of {image} timed out after {timeout_secs}s")]
    #[diagnostic(code(csi_image::pull::timed_out))]
    PullTimedOut {
        /// Image being pulled.
        image: String,
        /// Session timeout in seconds.
        timeout_secs: u64,
    },

    /// A caller stopped waiting before the operation finished.
    #[error("Gave up waiting for {operation} after {waited_ms}ms, it is still running")]
    #[diagnostic(code(csi_image::wait_timeout))]
    WaitTimeout {
        /// Operation being waited on.
        operation: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Every pull attempt failed.
    #[error("Failed to pull {image}: {message}")]
    #[diagnostic(code(csi_image::pull::failed))]
    PullFailed {
        /// Image that failed to pull.
        image: String,
        /// Aggregated failure detail.
        message: String,
    },

    /// The node plugin is shutting down.
    #[error("Shutting down: {operation} abandoned")]
    #[diagnostic(code(csi_image::shutdown))]
    ShuttingDown {
        /// The abandoned operation.
        operation: String,
    },

    /// A rate limiter could not grant a token at all.
    #[error("Rate limiter for {operation} cannot grant a token")]
    #[diagnostic(
        code(csi_image::rate_limit),
        help("Both the rate and the burst of a limiter must be positive")
    )]
    RateLimit {
        /// Limited operation (mount or unmount).
        operation: String,
    },

    /// An existing snapshot does not match the requested configuration.
    #[error("Snapshot {key} already exists with a different configuration: {message}")]
    #[diagnostic(
        code(csi_image::snapshot::conflict),
        help("The existing snapshot is left untouched; remove it manually if it is stale")
    )]
    SnapshotConflict {
        /// Snapshot key.
        key: String,
        /// Mismatch detail.
        message: String,
    },

    /// Snapshot not found in the runtime.
    #[error("Snapshot not found: {key}")]
    #[diagnostic(code(csi_image::snapshot::not_found))]
    SnapshotNotFound {
        /// Snapshot key.
        key: String,
    },

    /// Image not found in the runtime.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(csi_image::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// The container runtime rejected an operation.
    #[error("Runtime error during {operation}: {message}")]
    #[diagnostic(code(csi_image::runtime))]
    Runtime {
        /// Runtime operation.
        operation: String,
        /// Runtime failure detail.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(csi_image::io))]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(csi_image::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(csi_image::internal),
        help("This is a bug, please report it with the node plugin logs attached")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CsiImageError {
    /// Shorthand for a runtime failure.
    pub fn runtime(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for an invalid request.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for timeouts, as opposed to genuine failures.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PullTimedOut { .. } | Self::WaitTimeout { .. })
    }

    /// Name of the remote-call status code the CSI layer should answer with.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::QueueFull { .. } | Self::RateLimit { .. } => "ResourceExhausted",
            Self::FailedPrecondition { .. } => "FailedPrecondition",
            Self::PullTimedOut { .. } | Self::WaitTimeout { .. } => "DeadlineExceeded",
            Self::ShuttingDown { .. } => "Unavailable",
            Self::SnapshotConflict { .. } => "AlreadyExists",
            Self::SnapshotNotFound { .. } | Self::ImageNotFound { .. } => "NotFound",
            Self::PullFailed { .. }
            | Self::Runtime { .. }
            | Self::Io(_)
            | Self::Config { .. }
            | Self::Internal { .. } => "Internal",
        }
    }
}

impl From<toml::de::Error> for CsiImageError {
    fn from(err: toml::de::Error) -> Self {
        CsiImageError::Config {
            message: err.to_string(),
        }
    }
}
