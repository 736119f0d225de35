//! Live run event feed
//!
//! Server-sent events mirroring the coordinator's broadcast channel.
//! Slow subscribers skip what they missed rather than stalling publishers.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use conveyor_core::domain::run::RunEvent;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::api::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub run_id: Option<Uuid>,
}

fn event_name(event: &RunEvent) -> &'static str {
    match event {
        RunEvent::Created { .. } => "created",
        RunEvent::StatusChanged { .. } => "status_changed",
        RunEvent::StageCompleted { .. } => "stage_completed",
    }
}

/// GET /events?run_id=
pub async fn stream_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.coordinator.subscribe();

    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) if filter.run_id.is_none_or(|id| id == event.run_id()) => Some(
            Event::default()
                .event(event_name(&event))
                .json_data(&event),
        ),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::run::{PipelineKind, RunStatus};

    #[test]
    fn test_event_names() {
        let id = Uuid::new_v4();
        assert_eq!(
            event_name(&RunEvent::Created {
                run_id: id,
                kind: PipelineKind::Cd
            }),
            "created"
        );
        assert_eq!(
            event_name(&RunEvent::StatusChanged {
                run_id: id,
                status: RunStatus::Running,
                failure: None
            }),
            "status_changed"
        );
    }
}
