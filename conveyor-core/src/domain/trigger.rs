//! Trigger domain types
//!
//! Inputs delivered by the version-control hosting and image-build collaborators.

use serde::{Deserialize, Serialize};

use crate::domain::artifact::BuildArtifact;

/// A push to some branch of some repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
}

/// A finished image build for a push to the application repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub trigger: TriggerEvent,
    pub artifact: BuildArtifact,
}
