//! Service Module
//!
//! Business logic layer for the orchestrator: the four pipeline components
//! and the coordinator sequencing them.

pub mod approval;
pub mod coordinator;
pub mod deployer;
pub mod propagator;

pub use approval::ApprovalGate;
pub use coordinator::{Coordinator, CoordinatorError, PipelineSettings};
pub use deployer::ClusterDeployer;
pub use propagator::TagPropagator;
