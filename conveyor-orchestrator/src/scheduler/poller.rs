//! Configuration repository poller
//!
//! Polls the remote head of the configuration branch and fires a CD
//! trigger whenever it moves. The first head observed is only recorded, and
//! a head some other trigger (a webhook) already started a CD run for only
//! moves the baseline.

use anyhow::{Context, Result};
use conveyor_core::domain::run::PipelineRun;
use conveyor_core::domain::trigger::TriggerEvent;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::service::{Coordinator, CoordinatorError};
use crate::vcs::{Revision, VcsClient};

pub struct ConfigRepoPoller {
    coordinator: Arc<Coordinator>,
    vcs: Arc<VcsClient>,
    interval: Duration,
    last_seen: Option<Revision>,
}

impl ConfigRepoPoller {
    pub fn new(coordinator: Arc<Coordinator>, vcs: Arc<VcsClient>, interval: Duration) -> Self {
        Self {
            coordinator,
            vcs,
            interval,
            last_seen: None,
        }
    }

    /// Starts the polling loop
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Starting config repository poller (interval: {:?})",
            self.interval
        );

        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Config repository poller stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once(&shutdown).await {
                error!("Error during poll cycle: {:#}", e);
            }
        }
    }

    /// Performs a single poll cycle, returning the CD run it started
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<Option<PipelineRun>> {
        let settings = self.coordinator.settings();

        let head = self
            .vcs
            .remote_head(&settings.config_repo, cancel)
            .await
            .context("Failed to read config repository head")?;

        let Some(head) = head else {
            debug!("Config branch {} has no commits", settings.config_branch);
            return Ok(None);
        };

        let Some(previous) = self.last_seen.as_ref() else {
            info!("Config repository baseline at {}", head);
            self.last_seen = Some(head);
            return Ok(None);
        };

        if *previous == head {
            debug!("Config repository unchanged at {}", head);
            return Ok(None);
        }

        info!("Config repository moved {} -> {}", previous, head);

        if self
            .coordinator
            .has_cd_run_for(&head)
            .await
            .context("Failed to look up CD runs")?
        {
            info!("CD run for {} already started by another trigger", head);
            self.last_seen = Some(head);
            return Ok(None);
        }

        let event = TriggerEvent {
            repository: settings.config_repo.clone(),
            branch: settings.config_branch.clone(),
            commit_sha: head.clone(),
        };

        match self.coordinator.handle_trigger(event).await {
            Ok(run) => {
                self.last_seen = Some(head);
                Ok(run)
            }
            Err(CoordinatorError::RunConflict { existing, .. }) => {
                // Leave last_seen behind so the next tick retries
                debug!("CD run {} still active, deferring {}", existing, head);
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to trigger CD run"),
        }
    }
}
