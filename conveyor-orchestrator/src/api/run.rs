//! Run API Handlers
//!
//! HTTP endpoints for run status, stage events, cancellation and rollback.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conveyor_core::domain::run::{PipelineRun, StageEvent};
use conveyor_core::dto::run::{RollbackRequest, RunSummary};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// GET /run/list
/// List all runs, most recent first
pub async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs");

    let runs = state.coordinator.list_runs().await?;
    Ok(Json(runs.into_iter().map(RunSummary::from).collect()))
}

/// GET /run/{id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(state.coordinator.get_status(id).await?))
}

/// GET /run/{id}/events
/// Append-only stage-event log of a run
pub async fn get_run_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<StageEvent>>> {
    Ok(Json(state.coordinator.events(id).await?))
}

/// POST /run/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancel requested for run: {}", id);

    state.coordinator.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /run/rollback
/// Replays the CI pipeline with an earlier image tag
pub async fn rollback(
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    if req.tag.trim().is_empty() {
        return Err(ApiError::BadRequest("tag cannot be empty".to_string()));
    }

    let run = state.coordinator.rollback(req.tag.trim()).await?;
    Ok((StatusCode::CREATED, Json(run.into())))
}
