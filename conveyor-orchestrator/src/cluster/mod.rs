//! Cluster API access
//!
//! The deployer only needs two calls from a cluster: submit a descriptor and
//! read back a deployment's replica counts. Backends:
//! - [`KubectlCluster`]: shells out to `kubectl`
//! - [`InMemoryCluster`]: in-process cluster for tests and dry runs

pub mod kubectl;
pub mod memory;

use async_trait::async_trait;
use conveyor_core::domain::descriptor::{DeploymentDescriptor, DescriptorKind};
use conveyor_core::domain::rollout::DeploymentState;
use thiserror::Error;

pub use kubectl::KubectlCluster;
pub use memory::{InMemoryCluster, RolloutMode};

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster refused the descriptor (validation, admission, quota)
    #[error("cluster rejected {kind} '{name}': {message}")]
    Rejected {
        kind: DescriptorKind,
        name: String,
        message: String,
    },

    #[error("deployment '{0}' not found")]
    NotFound(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<(), ClusterError>;

    async fn deployment_status(&self, name: &str) -> Result<DeploymentState, ClusterError>;
}
