//! Build artifact domain types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Image produced by the build stage
///
/// Created once by the image-build collaborator and never mutated afterwards.
/// Downstream stages only ever reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Application repository the image was built from
    pub repository: String,

    /// Image name including registry, without tag (e.g. "registry.io/org/app")
    pub image: String,

    /// Build tag, usually a monotonic build counter or a content hash
    pub tag: String,

    /// Content digest reported by the builder (e.g. "sha256:...")
    #[serde(default)]
    pub digest: Option<String>,
}

/// Reasons a build reference is refused before propagation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("image name is empty")]
    EmptyImage,

    #[error("invalid image name '{0}'")]
    InvalidImage(String),

    #[error("invalid image tag '{0}'")]
    InvalidTag(String),

    #[error("invalid image digest '{0}'")]
    InvalidDigest(String),

    #[error("image '{actual}' does not match the configured image '{expected}'")]
    UnexpectedImage { expected: String, actual: String },
}

impl BuildArtifact {
    pub fn new(
        repository: impl Into<String>,
        image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            image: image.into(),
            tag: tag.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Full image reference written into descriptors (`image:tag`)
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Checks that the artifact is a well-formed, tagged image reference
    pub fn validate(&self) -> Result<(), ArtifactError> {
        validate_image_name(&self.image)?;
        validate_tag(&self.tag)?;

        if let Some(digest) = &self.digest {
            validate_digest(digest)?;
        }

        Ok(())
    }
}

fn validate_image_name(image: &str) -> Result<(), ArtifactError> {
    if image.is_empty() {
        return Err(ArtifactError::EmptyImage);
    }

    let valid_chars = image
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/:".contains(c));

    // A colon is only legal in the registry host part (e.g. localhost:5000/app)
    let last_component = image.rsplit('/').next().unwrap_or(image);

    if !valid_chars
        || last_component.contains(':')
        || last_component.is_empty()
        || image.starts_with('/')
    {
        return Err(ArtifactError::InvalidImage(image.to_string()));
    }

    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), ArtifactError> {
    let mut chars = tag.chars();

    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));

    if !first_ok || !rest_ok || tag.len() > 128 {
        return Err(ArtifactError::InvalidTag(tag.to_string()));
    }

    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), ArtifactError> {
    let valid = digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()));

    if !valid {
        return Err(ArtifactError::InvalidDigest(digest.to_string()));
    }

    Ok(())
}
