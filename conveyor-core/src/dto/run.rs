//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{FailureReason, PipelineKind, PipelineRun, RunStatus, Stage};

/// Lightweight run summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub kind: PipelineKind,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub last_successful_stage: Option<Stage>,
    pub image_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
}

impl From<PipelineRun> for RunSummary {
    fn from(run: PipelineRun) -> Self {
        Self {
            id: run.id,
            kind: run.kind,
            status: run.status,
            current_stage: run.current_stage,
            last_successful_stage: run.last_successful_stage,
            image_ref: run.artifact.as_ref().map(|a| a.image_ref()),
            started_at: run.started_at,
            ended_at: run.ended_at,
            failure: run.failure,
        }
    }
}

/// Request to redeploy an earlier build tag of the configured image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub tag: String,
}
