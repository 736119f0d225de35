//! Approval domain types
//!
//! The request itself is a pure state machine:
//! `Pending → {Approved, Rejected, Expired}`, all three terminal. A request
//! whose run stops waiting before any of these is closed as `Withdrawn`.
//! Timers and waiting live in the orchestrator's approval gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
    /// Closed because its run stopped waiting (cancellation, shutdown)
    Withdrawn,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        self != ApprovalState::Pending
    }
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalState::Pending => write!(f, "Pending"),
            ApprovalState::Approved => write!(f, "Approved"),
            ApprovalState::Rejected => write!(f, "Rejected"),
            ApprovalState::Expired => write!(f, "Expired"),
            ApprovalState::Withdrawn => write!(f, "Withdrawn"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request {id} is already {state}")]
    Closed { id: Uuid, state: ApprovalState },

    #[error("approver identity must not be empty")]
    EmptyIdentity,
}

/// Manual checkpoint guarding a CD run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub required: u32,
    /// Distinct approver identities received so far
    pub approvals: BTreeSet<String>,
    pub rejected_by: Option<String>,
    pub deadline: DateTime<Utc>,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Creates a pending request; a required count of zero is treated as one
    pub fn new(run_id: Uuid, required: u32, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            required: required.max(1),
            approvals: BTreeSet::new(),
            rejected_by: None,
            deadline,
            state: ApprovalState::Pending,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    fn ensure_pending(&self) -> Result<(), ApprovalError> {
        if self.state.is_terminal() {
            return Err(ApprovalError::Closed {
                id: self.id,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Adds an approval; repeated identities count once
    pub fn record_approval(&mut self, approver: &str) -> Result<ApprovalState, ApprovalError> {
        self.ensure_pending()?;

        let approver = approver.trim();
        if approver.is_empty() {
            return Err(ApprovalError::EmptyIdentity);
        }

        self.approvals.insert(approver.to_string());

        if self.approvals.len() >= self.required as usize {
            self.state = ApprovalState::Approved;
            self.decided_at = Some(Utc::now());
        }

        Ok(self.state)
    }

    /// A single rejection vetoes the request
    pub fn record_rejection(&mut self, approver: &str) -> Result<ApprovalState, ApprovalError> {
        self.ensure_pending()?;

        let approver = approver.trim();
        if approver.is_empty() {
            return Err(ApprovalError::EmptyIdentity);
        }

        self.rejected_by = Some(approver.to_string());
        self.state = ApprovalState::Rejected;
        self.decided_at = Some(Utc::now());

        Ok(self.state)
    }

    /// Expires the request if it is still pending at or past its deadline
    pub fn expire_if_overdue(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == ApprovalState::Pending && now >= self.deadline {
            self.state = ApprovalState::Expired;
            self.decided_at = Some(now);
            return true;
        }
        false
    }

    /// Closes a still-pending request without a decision
    pub fn withdraw(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == ApprovalState::Pending {
            self.state = ApprovalState::Withdrawn;
            self.decided_at = Some(now);
            return true;
        }
        false
    }
}
