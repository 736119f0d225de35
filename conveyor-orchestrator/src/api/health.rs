//! Health Check API Handler

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub active_runs: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_runs: state.coordinator.active_runs(),
    })
}
