//! In-process cluster
//!
//! Used by tests and by dry runs (`CONVEYOR_CLUSTER_BACKEND=memory`).
//! Applied deployments progress by a configurable [`RolloutMode`] each time
//! their status is read.

use super::{ClusterApi, ClusterError};
use async_trait::async_trait;
use conveyor_core::domain::descriptor::{DeploymentDescriptor, DescriptorKind};
use conveyor_core::domain::rollout::{DeploymentCondition, DeploymentState};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

/// How applied deployments converge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutMode {
    /// Fully ready on the first status read
    Instant,
    /// Ready count grows by this many replicas per status read
    Step(u32),
    /// Never becomes ready
    Stalled,
}

#[derive(Default)]
struct State {
    deployments: HashMap<String, DeploymentState>,
    applied: Vec<DeploymentDescriptor>,
    rejected: HashSet<String>,
    unavailable: bool,
    status_polls: usize,
}

pub struct InMemoryCluster {
    mode: RolloutMode,
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new(mode: RolloutMode) -> Self {
        Self {
            mode,
            state: Mutex::new(State::default()),
        }
    }

    /// Makes every later apply of `name` fail as a rejection
    pub fn reject(&self, name: impl Into<String>) {
        self.lock().rejected.insert(name.into());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Every descriptor accepted so far, in apply order
    pub fn applied(&self) -> Vec<DeploymentDescriptor> {
        self.lock().applied.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.lock().status_polls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

fn progressing(reason: &str) -> DeploymentCondition {
    DeploymentCondition {
        condition_type: "Progressing".to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: None,
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<(), ClusterError> {
        let mut state = self.lock();

        if state.unavailable {
            return Err(ClusterError::Unavailable("cluster offline".to_string()));
        }

        if state.rejected.contains(&descriptor.name) {
            return Err(ClusterError::Rejected {
                kind: descriptor.kind.clone(),
                name: descriptor.name.clone(),
                message: "admission webhook denied the request".to_string(),
            });
        }

        if descriptor.kind == DescriptorKind::Deployment {
            let desired = descriptor.replicas.unwrap_or(1);
            state.deployments.insert(
                descriptor.name.clone(),
                DeploymentState {
                    desired_replicas: desired,
                    observed_replicas: desired,
                    ready_replicas: 0,
                    conditions: vec![progressing("ReplicaSetUpdated")],
                },
            );
        }

        info!("Applied {} '{}' in memory", descriptor.kind, descriptor.name);
        state.applied.push(descriptor.clone());
        Ok(())
    }

    async fn deployment_status(&self, name: &str) -> Result<DeploymentState, ClusterError> {
        let mut state = self.lock();
        state.status_polls += 1;

        if state.unavailable {
            return Err(ClusterError::Unavailable("cluster offline".to_string()));
        }

        let mode = self.mode;
        let deployment = state
            .deployments
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;

        let ready = match mode {
            RolloutMode::Instant => deployment.desired_replicas,
            RolloutMode::Step(step) => (deployment.ready_replicas + step).min(deployment.desired_replicas),
            RolloutMode::Stalled => deployment.ready_replicas,
        };

        if ready != deployment.ready_replicas {
            deployment.ready_replicas = ready;
            if ready == deployment.desired_replicas {
                deployment.conditions = vec![progressing("NewReplicaSetAvailable")];
            }
        }

        Ok(deployment.clone())
    }
}
