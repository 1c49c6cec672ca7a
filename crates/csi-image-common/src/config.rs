//! Node plugin configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CsiImageError, CsiImageResult};

/// Environment variable forcing async pulls on or off.
pub const ENV_ASYNC_PULL: &str = "CSI_IMAGE_ASYNC_PULL";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "CSI_IMAGE_LOG_LEVEL";

/// Configuration for the pull and mount machinery of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Pull through the synchronizer instead of inline.
    pub async_pull: bool,
    /// Upper bound for a single pull session (seconds).
    pub async_pull_timeout: u64,
    /// Capacity of the pull admission queue.
    pub pull_queue_size: usize,
    /// Run mounts in the background and let callers wait for them.
    pub async_mount: bool,
    /// Mount operations per second.
    pub mount_rate: f64,
    /// Mount burst size.
    pub mount_burst: u32,
    /// Unmount operations per second.
    pub unmount_rate: f64,
    /// Unmount burst size.
    pub unmount_burst: u32,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// Docker config file holding registry credentials.
    pub docker_config: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            async_pull: false,
            async_pull_timeout: 600,
            pull_queue_size: 100,
            async_mount: false,
            mount_rate: 10.0,
            mount_burst: 5,
            unmount_rate: 50.0,
            unmount_burst: 20,
            log_level: "info".to_string(),
            log_json: false,
            docker_config: None,
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> CsiImageResult<Self> {
        let config: Self = toml::from_str(content)?;
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> CsiImageResult<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading node configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn with_env_overrides(mut self) -> CsiImageResult<Self> {
        if let Ok(value) = std::env::var(ENV_ASYNC_PULL) {
            self.async_pull = value.parse().map_err(|_| CsiImageError::Config {
                message: format!("{} must be true or false, got '{}'", ENV_ASYNC_PULL, value),
            })?;
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        Ok(self)
    }

    /// Check that queue sizes and rates are usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unusable setting.
    pub fn validate(&self) -> CsiImageResult<()> {
        let invalid = |message: &str| {
            Err(CsiImageError::Config {
                message: message.to_string(),
            })
        };
        if self.pull_queue_size == 0 {
            return invalid("pull_queue_size must be at least 1");
        }
        if self.async_pull_timeout == 0 {
            return invalid("async_pull_timeout must be at least 1 second");
        }
        if self.mount_rate <= 0.0 || self.mount_burst == 0 {
            return invalid("mount_rate and mount_burst must be positive");
        }
        if self.unmount_rate <= 0.0 || self.unmount_burst == 0 {
            return invalid("unmount_rate and unmount_burst must be positive");
        }
        Ok(())
    }

    /// Session timeout for async pulls.
    #[must_use]
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.async_pull_timeout)
    }

    /// Enable async pulls with the given session timeout.
    #[must_use]
    pub fn with_async_pull(mut self, timeout: Duration) -> Self {
        self.async_pull = true;
        self.async_pull_timeout = timeout.as_secs().max(1);
        self
    }

    /// Enable async mounts.
    #[must_use]
    pub fn with_async_mount(mut self) -> Self {
        self.async_mount = true;
        self
    }

    /// Set the mount limiter.
    #[must_use]
    pub fn with_mount_rate(mut self, rate: f64, burst: u32) -> Self {
        self.mount_rate = rate;
        self.mount_burst = burst;
        self
    }

    /// Set the unmount limiter.
    #[must_use]
    pub fn with_unmount_rate(mut self, rate: f64, burst: u32) -> Self {
        self.unmount_rate = rate;
        self.unmount_burst = burst;
        self
    }

    /// Set the pull admission queue capacity.
    #[must_use]
    pub fn with_pull_queue_size(mut self, size: usize) -> Self {
        self.pull_queue_size = size;
        self
    }
}
