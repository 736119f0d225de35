//! Pipeline run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::artifact::BuildArtifact;
use crate::domain::rollout::RolloutStatus;

/// Which of the two pipelines a run belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    /// Build reference check and tag propagation (application repository)
    #[serde(rename = "CI")]
    Ci,
    /// Approval, apply and rollout verification (configuration repository)
    #[serde(rename = "CD")]
    Cd,
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineKind::Ci => write!(f, "CI"),
            PipelineKind::Cd => write!(f, "CD"),
        }
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Valid edges of `Pending → Running → [AwaitingApproval] → Running → terminal`
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;

        match (self, next) {
            (Pending, Running | Failed | Cancelled) => true,
            (Running, AwaitingApproval | Succeeded | Failed | Cancelled) => true,
            (AwaitingApproval, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::AwaitingApproval => "AwaitingApproval",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A single step of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    BuildReferenceCheck,
    TagPropagate,
    ApprovalGate,
    Apply,
    WaitForRollout,
}

impl Stage {
    /// Ordered stages executed for a pipeline kind
    pub fn plan(kind: PipelineKind, approval_required: bool) -> Vec<Stage> {
        match kind {
            PipelineKind::Ci => vec![Stage::BuildReferenceCheck, Stage::TagPropagate],
            PipelineKind::Cd if approval_required => {
                vec![Stage::ApprovalGate, Stage::Apply, Stage::WaitForRollout]
            }
            PipelineKind::Cd => vec![Stage::Apply, Stage::WaitForRollout],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::BuildReferenceCheck => "build-reference-check",
            Stage::TagPropagate => "tag-propagate",
            Stage::ApprovalGate => "approval-gate",
            Stage::Apply => "apply",
            Stage::WaitForRollout => "wait-for-rollout",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Append-only record of one executed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: StageOutcome,
    pub detail: Option<String>,
}

/// Most specific reason a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason")]
pub enum FailureReason {
    #[error("remote unreachable: {message}")]
    RemoteUnreachable { message: String },

    #[error("concurrent update conflict: {message}")]
    ConcurrentUpdateConflict { message: String },

    #[error("descriptor field not found: {message}")]
    DescriptorFieldNotFound { message: String },

    #[error("invalid descriptor: {message}")]
    DescriptorInvalid { message: String },

    #[error("invalid build artifact: {message}")]
    InvalidArtifact { message: String },

    #[error("apply rejected: {message}")]
    ApplyRejected { message: String },

    #[error("cluster unavailable: {message}")]
    ClusterUnavailable { message: String },

    #[error("rollout of '{deployment}' timed out at {last_status}")]
    RolloutTimeout {
        deployment: String,
        last_status: RolloutStatus,
    },

    #[error("approval rejected by {approver}")]
    ApprovalRejected { approver: String },

    #[error("approval expired with {received}/{required} approvals")]
    ApprovalExpired { received: usize, required: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FailureReason {
    /// Terminal run status this reason forces
    pub fn run_status(&self) -> RunStatus {
        match self {
            FailureReason::ApprovalExpired { .. } | FailureReason::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
}

/// One execution of the CI or CD pipeline
///
/// Created when a trigger fires and mutated only by the coordinator that owns
/// it. Terminal once its status is Succeeded, Failed or Cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub kind: PipelineKind,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub last_successful_stage: Option<Stage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact: Option<BuildArtifact>,
    pub commit_sha: Option<String>,
    pub approval_id: Option<Uuid>,
    pub failure: Option<FailureReason>,
    pub events: Vec<StageEvent>,
}

impl PipelineRun {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: RunStatus::Pending,
            current_stage: None,
            last_successful_stage: None,
            started_at: Utc::now(),
            ended_at: None,
            artifact: None,
            commit_sha: None,
            approval_id: None,
            failure: None,
            events: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: BuildArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run to `next`, stamping `ended_at` on terminal states
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() {
            self.current_stage = None;
            self.ended_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Ends the run with the status implied by `reason`
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), RunError> {
        self.transition(reason.run_status())?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Appends a stage event to the log
    pub fn record_stage(&mut self, event: StageEvent) {
        if event.outcome == StageOutcome::Succeeded {
            self.last_successful_stage = Some(event.stage);
        }
        self.events.push(event);
    }
}

/// Event published on the coordinator's feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Created {
        run_id: Uuid,
        kind: PipelineKind,
    },
    StatusChanged {
        run_id: Uuid,
        status: RunStatus,
        failure: Option<FailureReason>,
    },
    StageCompleted {
        run_id: Uuid,
        event: StageEvent,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Created { run_id, .. }
            | RunEvent::StatusChanged { run_id, .. }
            | RunEvent::StageCompleted { run_id, .. } => *run_id,
        }
    }
}
