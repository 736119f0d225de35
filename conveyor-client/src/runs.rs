//! Run-related API endpoints

use crate::ConveyorClient;
use crate::error::Result;
use conveyor_core::domain::run::{PipelineRun, StageEvent};
use conveyor_core::dto::run::RunSummary;
use uuid::Uuid;

impl ConveyorClient {
    /// List all runs, most recent first
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let response = self.client.get(self.url("/run/list")).send().await?;
        self.handle_response(response).await
    }

    /// Get the full record of a run, stage events included
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let response = self
            .client
            .get(self.url(&format!("/run/{}", run_id)))
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn get_run_events(&self, run_id: Uuid) -> Result<Vec<StageEvent>> {
        let response = self
            .client
            .get(self.url(&format!("/run/{}/events", run_id)))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Request cancellation of an active run
    ///
    /// The run stops at its next cancellation point; poll [`get_run`](Self::get_run)
    /// for the final status.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/run/{}/cancel", run_id)))
            .send()
            .await?;
        self.handle_empty_response(response).await
    }
}
