//! Cluster Deployer
//!
//! Submits descriptors to the cluster and verifies that the rollout of a
//! deployment converges. Rejections are never retried; polling failures
//! after the deployment exists are logged and the poll continues.

use conveyor_core::domain::descriptor::DeploymentDescriptor;
use conveyor_core::domain::rollout::RolloutStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("rollout wait cancelled")]
    Cancelled,
}

/// Outcome of applying a batch of descriptors
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// `kind/name` of each descriptor the cluster accepted, in order
    pub applied: Vec<String>,
}

pub struct ClusterDeployer {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl ClusterDeployer {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Submits each descriptor in order, stopping at the first failure
    pub async fn apply(
        &self,
        descriptors: &[DeploymentDescriptor],
    ) -> Result<ApplyReport, ClusterError> {
        let mut applied = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            self.cluster.apply(descriptor).await?;
            applied.push(format!("{}/{}", descriptor.kind, descriptor.name));
        }

        info!("Applied {} descriptor(s): {}", applied.len(), applied.join(", "));
        Ok(ApplyReport { applied })
    }

    /// Polls the deployment until all desired replicas are ready
    ///
    /// Returns `terminal = false` with the last observed status when the
    /// timeout elapses first. A missing deployment or an unavailable cluster
    /// on the very first poll is an error; later poll failures are retried
    /// on the next tick.
    pub async fn wait_for_rollout(
        &self,
        deployment: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RolloutStatus, DeployError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last = RolloutStatus::unobserved();
        let mut observed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                _ = time::sleep_until(deadline) => {
                    warn!(
                        "Rollout of '{}' did not converge within {:?}: {}",
                        deployment, timeout, last
                    );
                    return Ok(last);
                }
                _ = ticker.tick() => {}
            }

            match self.cluster.deployment_status(deployment).await {
                Ok(state) => {
                    observed = true;
                    last = RolloutStatus::from(&state);
                    debug!("Rollout of '{}': {}", deployment, last);

                    if last.terminal {
                        info!("Rollout of '{}' complete: {}", deployment, last);
                        return Ok(last);
                    }
                }
                Err(err) if !observed => return Err(err.into()),
                Err(err) => warn!("Failed to poll rollout of '{}': {}", deployment, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, RolloutMode};
    use conveyor_core::domain::descriptor::DescriptorSet;

    const MANIFESTS: &str = "\
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
---
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
      targetPort: 8080
";

    fn descriptors() -> Vec<DeploymentDescriptor> {
        DescriptorSet::parse(MANIFESTS).unwrap().descriptors().unwrap()
    }

    fn deployer(cluster: Arc<InMemoryCluster>) -> ClusterDeployer {
        ClusterDeployer::new(cluster).with_poll_interval(Duration::from_secs(3))
    }

    #[tokio::test]
    async fn test_apply_reports_every_descriptor() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Instant));
        let report = deployer(cluster.clone()).apply(&descriptors()).await.unwrap();

        assert_eq!(report.applied, vec!["Deployment/web", "Service/web"]);
        assert_eq!(cluster.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_stops_at_rejection() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Instant));
        cluster.reject("web");

        let err = deployer(cluster.clone()).apply(&descriptors()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { .. }));
        assert!(cluster.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_converges_across_polls() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Step(1)));
        let deployer = deployer(cluster.clone());
        deployer.apply(&descriptors()).await.unwrap();

        let status = deployer
            .wait_for_rollout("web", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert!(status.terminal);
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(cluster.status_polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_rollout_is_terminal_on_first_poll() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Instant));
        let deployer = deployer(cluster.clone());
        deployer.apply(&descriptors()).await.unwrap();

        let status = deployer
            .wait_for_rollout("web", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert!(status.terminal);
        assert_eq!(status.desired_replicas, 3);
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(cluster.status_polls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_cluster_on_first_poll_is_an_error() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Instant));
        let deployer = deployer(cluster.clone());
        deployer.apply(&descriptors()).await.unwrap();
        cluster.set_unavailable(true);

        let err = deployer
            .wait_for_rollout("web", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cluster(ClusterError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_timeout_returns_last_status() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Stalled));
        let deployer = deployer(cluster.clone());
        deployer.apply(&descriptors()).await.unwrap();

        let status = deployer
            .wait_for_rollout("web", Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!status.terminal);
        assert_eq!(status.desired_replicas, 3);
        assert_eq!(status.ready_replicas, 0);
        assert!(cluster.status_polls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_wait_is_cancellable() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Stalled));
        let deployer = deployer(cluster.clone());
        deployer.apply(&descriptors()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = deployer
            .wait_for_rollout("web", Duration::from_secs(600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_deployment_fails_fast() {
        let cluster = Arc::new(InMemoryCluster::new(RolloutMode::Instant));
        let err = deployer(cluster)
            .wait_for_rollout("ghost", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Cluster(ClusterError::NotFound(_))));
    }
}
