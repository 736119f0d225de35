//! Conveyor Orchestrator
//!
//! Drives image builds of one application onto a cluster:
//! - CI runs: check the built image, then commit its tag into the config repository
//! - CD runs: optionally wait for approval, apply the config repository's
//!   descriptors and watch the rollout converge
//!
//! Triggers arrive over HTTP (push webhooks, build notifications) or from
//! polling the config repository head.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod cluster;
pub mod config;
pub mod db;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod vcs;

use crate::api::AppState;
use crate::cluster::{ClusterApi, InMemoryCluster, KubectlCluster, RolloutMode};
use crate::config::{ClusterBackend, Config};
use crate::repository::{InMemoryRunRepository, PgRunRepository, RunRepository};
use crate::scheduler::ConfigRepoPoller;
use crate::service::{ApprovalGate, ClusterDeployer, Coordinator};
use crate::vcs::{GitCli, VcsClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conveyor Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Pipeline: {}@{} -> {}@{} (deployment {})",
        config.app_repo,
        config.app_branch,
        config.config_repo,
        config.config_branch,
        config.deployment_name
    );

    let git = Arc::new(GitCli::new(
        config.git_author_name.clone(),
        config.git_author_email.clone(),
    ));
    let config_vcs = Arc::new(
        VcsClient::new(git, config.config_branch.clone()).with_retry(config.retry_settings()),
    );

    let cluster: Arc<dyn ClusterApi> = match config.cluster_backend {
        ClusterBackend::Kubectl => Arc::new(KubectlCluster::new(
            config.kube_namespace.clone(),
            config.kube_context.clone(),
        )),
        ClusterBackend::Memory => {
            warn!("Using the in-memory cluster, nothing will be deployed");
            Arc::new(InMemoryCluster::new(RolloutMode::Instant))
        }
    };
    let deployer = ClusterDeployer::new(cluster).with_poll_interval(config.rollout_poll_interval);

    let runs: Arc<dyn RunRepository> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgRunRepository::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, runs are kept in memory only");
            Arc::new(InMemoryRunRepository::new())
        }
    };

    let shutdown = CancellationToken::new();

    let gate = Arc::new(ApprovalGate::with_archive_capacity(config.approval_history));
    let sweeper = gate
        .clone()
        .spawn_expiry_sweeper(config.approval_sweep_interval, shutdown.clone());

    let coordinator = Arc::new(Coordinator::new(
        config.pipeline_settings()?,
        runs,
        config_vcs.clone(),
        deployer,
        gate.clone(),
    ));

    let recovered = coordinator
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted runs")?;
    if recovered > 0 {
        warn!("Marked {} interrupted run(s) as failed", recovered);
    }

    let poller = if config.config_poll_interval.is_zero() {
        info!("Config repository polling disabled");
        None
    } else {
        let poller = ConfigRepoPoller::new(
            coordinator.clone(),
            config_vcs,
            config.config_poll_interval,
        );
        Some(tokio::spawn(poller.run(shutdown.clone())))
    };

    let app = api::create_router(AppState { coordinator, gate });

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = sweeper.await;
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    info!("Orchestrator stopped");
    Ok(())
}
