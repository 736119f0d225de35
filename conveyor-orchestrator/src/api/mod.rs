//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod approval;
pub mod error;
pub mod events;
pub mod health;
pub mod run;
pub mod trigger;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::{ApprovalGate, Coordinator};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub gate: Arc<ApprovalGate>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Trigger endpoints
        .route("/trigger/push", post(trigger::push))
        .route("/trigger/build", post(trigger::build))
        // Run endpoints
        .route("/run/list", get(run::list_runs))
        .route("/run/rollback", post(run::rollback))
        .route("/run/{id}", get(run::get_run))
        .route("/run/{id}/events", get(run::get_run_events))
        .route("/run/{id}/cancel", post(run::cancel_run))
        // Approval endpoints
        .route("/approval/pending", get(approval::list_pending))
        .route("/approval/{id}", get(approval::get_approval))
        .route("/approval/{id}/decision", post(approval::decide))
        // Live feed
        .route("/events", get(events::stream_events))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
