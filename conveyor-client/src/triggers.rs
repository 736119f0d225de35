//! Trigger endpoints

use crate::ConveyorClient;
use crate::error::Result;
use conveyor_core::domain::trigger::{BuildEvent, TriggerEvent};
use conveyor_core::dto::run::{RollbackRequest, RunSummary};

impl ConveyorClient {
    /// Report a repository push
    ///
    /// Returns the CD run it started, or `None` when the push concerns no pipeline.
    pub async fn notify_push(&self, event: &TriggerEvent) -> Result<Option<RunSummary>> {
        let response = self
            .client
            .post(self.url("/trigger/push"))
            .json(event)
            .send()
            .await?;
        self.handle_optional_response(response).await
    }

    /// Report a finished image build
    ///
    /// Returns the CI run it started, or `None` when the build is for another branch.
    pub async fn notify_build(&self, event: &BuildEvent) -> Result<Option<RunSummary>> {
        let response = self
            .client
            .post(self.url("/trigger/build"))
            .json(event)
            .send()
            .await?;
        self.handle_optional_response(response).await
    }

    /// Redeploy an earlier tag of the configured image
    pub async fn rollback(&self, tag: impl Into<String>) -> Result<RunSummary> {
        let req = RollbackRequest { tag: tag.into() };
        let response = self
            .client
            .post(self.url("/run/rollback"))
            .json(&req)
            .send()
            .await?;
        self.handle_response(response).await
    }
}
