//! Image reference parsing.

use std::str::FromStr;

use csi_image_common::{CsiImageError, CsiImageResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` -> pinned by digest
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for empty references or empty tags.
    pub fn parse(reference: &str) -> CsiImageResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CsiImageError::invalid_argument("image reference is empty"));
        }

        let (name, tag) = if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            (name, ImageTag::Digest(digest[1..].to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // registry:port/image has a slash after the colon
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                let (name, tag) = reference.split_at(idx);
                (name, ImageTag::Tag(tag[1..].to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        match &tag {
            ImageTag::Tag(t) | ImageTag::Digest(t) if t.is_empty() => {
                return Err(CsiImageError::invalid_argument(format!(
                    "image reference '{}' has an empty tag or digest",
                    reference
                )));
            }
            _ => {}
        }
        if name.is_empty() {
            return Err(CsiImageError::invalid_argument(format!(
                "image reference '{}' has no repository",
                reference
            )));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{}", name),
            ),
        };

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{}", t),
            ImageTag::Digest(d) => format!("@{}", d),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }

    /// Canonical host of a registry address as written in credential files.
    ///
    /// Strips schemes and paths and folds the Docker Hub aliases into
    /// `docker.io`.
    #[must_use]
    pub fn normalize_registry(address: &str) -> String {
        let host = address
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let host = host.split('/').next().unwrap_or(host);
        match host {
            "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
                Self::DEFAULT_REGISTRY.to_string()
            }
            other => other.to_ascii_lowercase(),
        }
    }
}

impl FromStr for ImageReference {
    type Err = CsiImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
