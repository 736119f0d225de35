//! Approval API Handlers
//!
//! Decisions from the approval-notification collaborator land here.

use axum::{
    Json,
    extract::{Path, State},
};
use conveyor_core::domain::approval::ApprovalRequest;
use conveyor_core::dto::approval::{ApprovalDecision, Decision};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// GET /approval/pending
pub async fn list_pending(State(state): State<AppState>) -> Json<Vec<ApprovalRequest>> {
    Json(state.gate.list_pending())
}

/// GET /approval/{id}
pub async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApprovalRequest>> {
    state
        .gate
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Approval request {} not found", id)))
}

/// POST /approval/{id}/decision
pub async fn decide(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApprovalDecision>,
) -> ApiResult<Json<ApprovalRequest>> {
    tracing::info!("{:?} on approval {} from {}", req.decision, id, req.approver);

    let request = match req.decision {
        Decision::Approve => state.gate.record_approval(id, &req.approver)?,
        Decision::Reject => state.gate.record_rejection(id, &req.approver)?,
    };

    Ok(Json(request))
}
