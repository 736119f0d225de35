//! Trigger API Handlers
//!
//! Entry points for the version-control hosting (push webhooks) and the
//! image builder (build notifications).

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conveyor_core::domain::run::PipelineRun;
use conveyor_core::domain::trigger::{BuildEvent, TriggerEvent};
use conveyor_core::dto::run::RunSummary;

use crate::api::AppState;
use crate::api::error::ApiResult;

fn launched(run: Option<PipelineRun>) -> Response {
    match run {
        Some(run) => (StatusCode::CREATED, Json(RunSummary::from(run))).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// POST /trigger/push
/// Starts a CD run for pushes to the configuration branch; other pushes are ignored
pub async fn push(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<Response> {
    tracing::info!(
        "Push to {}@{} ({})",
        event.repository,
        event.branch,
        event.commit_sha
    );

    let run = state.coordinator.handle_trigger(event).await?;
    Ok(launched(run))
}

/// POST /trigger/build
/// Starts a CI run for a finished build of the application branch
pub async fn build(
    State(state): State<AppState>,
    Json(event): Json<BuildEvent>,
) -> ApiResult<Response> {
    tracing::info!(
        "Build of {}@{} produced {}",
        event.trigger.repository,
        event.trigger.branch,
        event.artifact.image_ref()
    );

    let run = state.coordinator.handle_build(event).await?;
    Ok(launched(run))
}
