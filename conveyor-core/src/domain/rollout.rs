//! Rollout domain types

use serde::{Deserialize, Serialize};

/// Deployment state as reported by the cluster API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub desired_replicas: u32,
    pub observed_replicas: u32,
    pub ready_replicas: u32,
    #[serde(default)]
    pub conditions: Vec<DeploymentCondition>,
}

/// A single status condition of a deployment (e.g. `Available=True`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl std::fmt::Display for DeploymentCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.condition_type, self.status)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

/// Progress of a rollout, recomputed on every poll
///
/// Never persisted on its own; it only survives inside the owning run's
/// event log or failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub desired_replicas: u32,
    pub observed_replicas: u32,
    pub ready_replicas: u32,
    pub last_condition: Option<String>,
    /// True once ready replicas reached the desired count
    pub terminal: bool,
}

impl RolloutStatus {
    /// Status before the first successful poll
    pub fn unobserved() -> Self {
        Self {
            desired_replicas: 0,
            observed_replicas: 0,
            ready_replicas: 0,
            last_condition: None,
            terminal: false,
        }
    }
}

impl From<&DeploymentState> for RolloutStatus {
    fn from(state: &DeploymentState) -> Self {
        Self {
            desired_replicas: state.desired_replicas,
            observed_replicas: state.observed_replicas,
            ready_replicas: state.ready_replicas,
            last_condition: state.conditions.last().map(|c| c.to_string()),
            terminal: state.ready_replicas == state.desired_replicas,
        }
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ready ({} observed)",
            self.ready_replicas, self.desired_replicas, self.observed_replicas
        )?;
        if let Some(condition) = &self.last_condition {
            write!(f, ", last condition {}", condition)?;
        }
        Ok(())
    }
}
