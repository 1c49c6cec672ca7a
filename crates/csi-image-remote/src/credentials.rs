//! Registry credentials and keyring lookup.
//!
//! A [`Keyring`] answers "which credentials may be used to pull this image".
//! Credentials come from a Docker-compatible `config.json` on the node or
//! are handed in with the volume request.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use csi_image_common::{CsiImageError, CsiImageResult};
use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;

/// Registry credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Registry host.
    pub registry: String,
    /// Username.
    pub username: String,
    /// Password or token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Identity token (for OAuth).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Create a new credential.
    pub fn new(registry: &str, username: &str, password: &str) -> Self {
        Self {
            registry: ImageReference::normalize_registry(registry),
            username: username.to_string(),
            password: Some(password.to_string()),
            identity_token: None,
        }
    }

    /// Create with identity token (OAuth).
    pub fn with_token(registry: &str, token: &str) -> Self {
        Self {
            registry: ImageReference::normalize_registry(registry),
            username: String::new(),
            password: None,
            identity_token: Some(token.to_string()),
        }
    }

    /// Decode from base64 auth string (Docker format).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the string is not valid base64 UTF-8.
    pub fn from_docker_auth(registry: &str, auth: &str) -> CsiImageResult<Self> {
        let decoded = BASE64.decode(auth).map_err(|e| CsiImageError::Config {
            message: format!("Invalid base64 auth for {}: {}", registry, e),
        })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| CsiImageError::Config {
            message: format!("Invalid auth string for {}: {}", registry, e),
        })?;

        match auth_str.split_once(':') {
            Some((username, password)) => Ok(Self::new(registry, username, password)),
            None => Ok(Self {
                registry: ImageReference::normalize_registry(registry),
                username: auth_str,
                password: None,
                identity_token: None,
            }),
        }
    }

    /// Encode as base64 auth string (Docker format).
    pub fn to_docker_auth(&self) -> String {
        let auth_str = match &self.password {
            Some(pwd) => format!("{}:{}", self.username, pwd),
            None => self.username.clone(),
        };
        BASE64.encode(auth_str.as_bytes())
    }
}

/// Docker config.json format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Authentication entries.
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

/// Docker auth entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64-encoded auth string.
    #[serde(default)]
    pub auth: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Identity token.
    #[serde(default, rename = "identitytoken")]
    pub identity_token: Option<String>,
}

impl DockerAuthEntry {
    fn to_credential(&self, registry: &str) -> CsiImageResult<Option<Credential>> {
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            return Credential::from_docker_auth(registry, auth).map(Some);
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Some(Credential::new(registry, username, password)));
        }
        if let Some(token) = &self.identity_token {
            return Ok(Some(Credential::with_token(registry, token)));
        }
        Ok(None)
    }
}

/// Source of registry credentials for an image.
pub trait Keyring: Send + Sync {
    /// Credentials to try, in order, when pulling `image`.
    fn lookup(&self, image: &ImageReference) -> Vec<Credential>;
}

/// Keyring backed by a Docker `config.json`.
#[derive(Debug, Clone, Default)]
pub struct DockerConfigKeyring {
    credentials: Vec<Credential>,
}

impl DockerConfigKeyring {
    /// Default location (`~/.docker/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".docker")
            .join("config.json")
    }

    /// Load a keyring from a config file. A missing file yields an empty keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> CsiImageResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No docker config, using empty keyring");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let keyring = Self::from_json(&content)?;
        tracing::info!(
            path = %path.display(),
            credentials = keyring.credentials.len(),
            "Loaded registry credentials"
        );
        Ok(keyring)
    }

    /// Parse a config.json document.
    ///
    /// Entries that cannot be decoded are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON.
    pub fn from_json(content: &str) -> CsiImageResult<Self> {
        let config: DockerConfig =
            serde_json::from_str(content).map_err(|e| CsiImageError::Config {
                message: format!("Failed to parse Docker config: {}", e),
            })?;

        let mut credentials = Vec::new();
        for (registry, entry) in &config.auths {
            match entry.to_credential(registry) {
                Ok(Some(cred)) => credentials.push(cred),
                Ok(None) => {}
                Err(e) => tracing::warn!(registry = %registry, error = %e, "Skipping credential"),
            }
        }
        credentials.sort_by(|a, b| a.registry.cmp(&b.registry));

        Ok(Self { credentials })
    }

    /// Number of credentials held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// True if no credentials are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl Keyring for DockerConfigKeyring {
    fn lookup(&self, image: &ImageReference) -> Vec<Credential> {
        let registry = ImageReference::normalize_registry(&image.registry);
        self.credentials
            .iter()
            .filter(|c| c.registry == registry)
            .cloned()
            .collect()
    }
}

/// Fixed list of credentials, e.g. ones handed in with a volume request.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyring(pub Vec<Credential>);

impl Keyring for StaticKeyring {
    fn lookup(&self, image: &ImageReference) -> Vec<Credential> {
        let registry = ImageReference::normalize_registry(&image.registry);
        self.0
            .iter()
            .filter(|c| c.registry == registry)
            .cloned()
            .collect()
    }
}
