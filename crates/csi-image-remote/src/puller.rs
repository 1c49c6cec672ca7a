//! Pulling images through the runtime's image service.

use std::sync::Arc;

use async_trait::async_trait;
use csi_image_common::{CsiImageError, CsiImageResult};

use crate::credentials::{Credential, Keyring};
use crate::reference::ImageReference;

/// The runtime's image service (CRI `PullImage`).
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Pull `image`, authenticating with `credential` when given.
    async fn pull_image(
        &self,
        image: &ImageReference,
        credential: Option<&Credential>,
    ) -> CsiImageResult<()>;
}

/// Something that can fetch one image into the runtime.
///
/// Cancellation is expressed by dropping the returned future.
#[async_trait]
pub trait Puller: Send + Sync {
    /// Fetch the image.
    async fn pull(&self) -> CsiImageResult<()>;
}

/// Puller that tries every applicable credential in turn.
pub struct RemotePuller {
    service: Arc<dyn ImageService>,
    image: ImageReference,
    credentials: Vec<Credential>,
}

impl RemotePuller {
    /// Create a puller for `image` using credentials from `keyring`.
    pub fn new(service: Arc<dyn ImageService>, image: ImageReference, keyring: &dyn Keyring) -> Self {
        let credentials = keyring.lookup(&image);
        Self {
            service,
            image,
            credentials,
        }
    }

    /// Put request-scoped credentials ahead of the keyring ones.
    #[must_use]
    pub fn with_extra_credentials(mut self, extra: Vec<Credential>) -> Self {
        let registry = ImageReference::normalize_registry(&self.image.registry);
        let mut credentials: Vec<_> = extra
            .into_iter()
            .filter(|c| c.registry == registry)
            .collect();
        credentials.append(&mut self.credentials);
        self.credentials = credentials;
        self
    }

    /// The image this puller fetches.
    #[must_use]
    pub fn image(&self) -> &ImageReference {
        &self.image
    }
}

#[async_trait]
impl Puller for RemotePuller {
    async fn pull(&self) -> CsiImageResult<()> {
        if self.credentials.is_empty() {
            tracing::debug!(image = %self.image, "Pulling anonymously");
            return self.service.pull_image(&self.image, None).await;
        }

        let mut failures = Vec::with_capacity(self.credentials.len());
        for credential in &self.credentials {
            tracing::debug!(
                image = %self.image,
                username = %credential.username,
                "Pulling with credential"
            );
            match self.service.pull_image(&self.image, Some(credential)).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(image = %self.image, error = %e, "Credential rejected");
                    failures.push(format!("{}@{}: {}", credential.username, credential.registry, e));
                }
            }
        }

        Err(CsiImageError::PullFailed {
            image: self.image.to_string(),
            message: format!(
                "all {} credentials failed: [{}]",
                failures.len(),
                failures.join("; ")
            ),
        })
    }
}
