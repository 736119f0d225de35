//! Approval endpoints

use crate::ConveyorClient;
use crate::error::Result;
use conveyor_core::domain::approval::ApprovalRequest;
use conveyor_core::dto::approval::{ApprovalDecision, Decision};
use uuid::Uuid;

impl ConveyorClient {
    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        let response = self.client.get(self.url("/approval/pending")).send().await?;
        self.handle_response(response).await
    }

    pub async fn get_approval(&self, approval_id: Uuid) -> Result<ApprovalRequest> {
        let response = self
            .client
            .get(self.url(&format!("/approval/{}", approval_id)))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Deliver an approver's decision, returning the updated request
    pub async fn decide(
        &self,
        approval_id: Uuid,
        approver: impl Into<String>,
        decision: Decision,
    ) -> Result<ApprovalRequest> {
        let req = ApprovalDecision {
            approver: approver.into(),
            decision,
        };
        let response = self
            .client
            .post(self.url(&format!("/approval/{}/decision", approval_id)))
            .json(&req)
            .send()
            .await?;
        self.handle_response(response).await
    }
}
