//! Approval Gate
//!
//! Holds the approval requests of CD runs. Decisions arrive from the API
//! while the owning run waits in [`ApprovalGate::await_decision`]; each
//! request carries a watch channel so waiters wake on the first terminal
//! state. Overdue requests are expired both by the waiter's own deadline
//! timer and by a background sweeper. Closed requests stay readable in a
//! bounded archive; the oldest decisions are dropped first.

use chrono::{DateTime, Utc};
use conveyor_core::domain::approval::{ApprovalError, ApprovalRequest, ApprovalState};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of waiting on a request
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The request reached Approved, Rejected or Expired
    Decided(ApprovalRequest),
    Cancelled,
}

struct Entry {
    request: ApprovalRequest,
    state: watch::Sender<ApprovalState>,
}

impl Entry {
    fn publish(&self) {
        self.state.send_replace(self.request.state);
    }
}

/// Closed requests kept readable by default
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 500;

#[derive(Default)]
struct Archive {
    requests: HashMap<Uuid, ApprovalRequest>,
    /// Archive order, oldest first
    order: VecDeque<Uuid>,
}

pub struct ApprovalGate {
    open: Mutex<HashMap<Uuid, Entry>>,
    archived: Mutex<Archive>,
    archive_capacity: usize,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::with_archive_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    /// Gate keeping at most `capacity` closed requests readable
    pub fn with_archive_capacity(capacity: usize) -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            archived: Mutex::new(Archive::default()),
            archive_capacity: capacity.max(1),
        }
    }

    pub fn request_approval(
        &self,
        run_id: Uuid,
        required: u32,
        deadline: DateTime<Utc>,
    ) -> ApprovalRequest {
        let request = ApprovalRequest::new(run_id, required, deadline);
        let (state, _) = watch::channel(request.state);

        info!(
            "Approval {} requested for run {} ({} approval(s) before {})",
            request.id, run_id, request.required, deadline
        );

        self.open.lock().unwrap().insert(
            request.id,
            Entry {
                request: request.clone(),
                state,
            },
        );
        request
    }

    pub fn record_approval(&self, id: Uuid, approver: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.decide(id, |request| request.record_approval(approver))
    }

    pub fn record_rejection(
        &self,
        id: Uuid,
        approver: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.decide(id, |request| request.record_rejection(approver))
    }

    fn decide<F>(&self, id: Uuid, apply: F) -> Result<ApprovalRequest, ApprovalError>
    where
        F: FnOnce(&mut ApprovalRequest) -> Result<ApprovalState, ApprovalError>,
    {
        let mut open = self.open.lock().unwrap();
        let Some(entry) = open.get_mut(&id) else {
            return Err(self.closed_or_missing(id));
        };

        // A decision arriving after the deadline loses to the timeout
        if entry.request.expire_if_overdue(Utc::now()) {
            entry.publish();
        }

        let state = apply(&mut entry.request)?;
        if state.is_terminal() {
            info!("Approval {} decided: {}", id, state);
            entry.publish();
        } else {
            debug!(
                "Approval {} has {}/{} approval(s)",
                id,
                entry.request.approvals.len(),
                entry.request.required
            );
        }

        Ok(entry.request.clone())
    }

    fn closed_or_missing(&self, id: Uuid) -> ApprovalError {
        match self.archived.lock().unwrap().requests.get(&id) {
            Some(request) => ApprovalError::Closed {
                id,
                state: request.state,
            },
            None => ApprovalError::NotFound(id),
        }
    }

    /// Expires every pending request whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut open = self.open.lock().unwrap();
        let mut expired = Vec::new();

        for (id, entry) in open.iter_mut() {
            if entry.request.expire_if_overdue(now) {
                warn!("Approval {} expired", id);
                entry.publish();
                expired.push(*id);
            }
        }

        expired
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        if let Some(entry) = self.open.lock().unwrap().get(&id) {
            return Some(entry.request.clone());
        }
        self.archived.lock().unwrap().requests.get(&id).cloned()
    }

    /// Pending requests, oldest first
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .open
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.request.state == ApprovalState::Pending)
            .map(|entry| entry.request.clone())
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    /// Closes a request once its run leaves the approval stage
    ///
    /// A request archived while still pending is withdrawn, or expired if its
    /// deadline has already passed.
    pub fn archive(&self, id: Uuid) -> Option<ApprovalRequest> {
        let mut entry = self.open.lock().unwrap().remove(&id)?;

        let now = Utc::now();
        if entry.request.expire_if_overdue(now) || entry.request.withdraw(now) {
            info!("Approval {} closed as {}", id, entry.request.state);
            entry.publish();
        }

        let request = entry.request;
        let mut archived = self.archived.lock().unwrap();
        if archived.requests.insert(id, request.clone()).is_none() {
            archived.order.push_back(id);
        }
        while archived.order.len() > self.archive_capacity {
            if let Some(oldest) = archived.order.pop_front() {
                debug!("Dropping archived approval {}", oldest);
                archived.requests.remove(&oldest);
            }
        }

        Some(request)
    }

    /// Waits for the request to reach a terminal state, its deadline, or cancellation
    pub async fn await_decision(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, ApprovalError> {
        let subscription = {
            let open = self.open.lock().unwrap();
            open.get(&id)
                .map(|entry| (entry.state.subscribe(), entry.request.deadline))
        };

        let Some((mut changes, deadline)) = subscription else {
            return match self.get(id) {
                Some(request) => Ok(WaitOutcome::Decided(request)),
                None => Err(ApprovalError::NotFound(id)),
            };
        };

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let timer = time::sleep(remaining);
        tokio::pin!(timer);

        loop {
            if changes.borrow_and_update().is_terminal() {
                return self
                    .get(id)
                    .map(WaitOutcome::Decided)
                    .ok_or(ApprovalError::NotFound(id));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
                _ = &mut timer => {
                    self.force_expiry(id, deadline);
                    return self
                        .get(id)
                        .map(WaitOutcome::Decided)
                        .ok_or(ApprovalError::NotFound(id));
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        // Sender dropped: the request was archived
                        return self
                            .get(id)
                            .map(WaitOutcome::Decided)
                            .ok_or(ApprovalError::NotFound(id));
                    }
                }
            }
        }
    }

    /// Expires the request once its deadline timer fired, regardless of wall clock skew
    fn force_expiry(&self, id: Uuid, deadline: DateTime<Utc>) {
        if let Some(entry) = self.open.lock().unwrap().get_mut(&id) {
            if entry.request.expire_if_overdue(Utc::now().max(deadline)) {
                warn!("Approval {} expired", id);
                entry.publish();
            }
        }
    }

    /// Spawns the background task expiring overdue requests
    pub fn spawn_expiry_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Approval sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = self.expire_overdue(Utc::now());
                        if !expired.is_empty() {
                            info!("Expired {} overdue approval(s)", expired.len());
                        }
                    }
                }
            }
        })
    }
}
