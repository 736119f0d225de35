//! Pipeline Coordinator
//!
//! Owns every pipeline run: creates it from a trigger, executes its stages
//! in a dedicated task, persists it after each transition and publishes
//! [`RunEvent`]s on a broadcast feed.
//!
//! Stages run strictly in order and fail fast. Each run carries its own
//! [`CancellationToken`], threaded into every suspension point (network
//! calls, approval wait, rollout poll).

use chrono::Utc;
use conveyor_core::domain::approval::ApprovalState;
use conveyor_core::domain::artifact::{ArtifactError, BuildArtifact};
use conveyor_core::domain::descriptor::{
    DeploymentDescriptor, DescriptorError, DescriptorSet, ImageField,
};
use conveyor_core::domain::run::{
    FailureReason, PipelineKind, PipelineRun, RunStatus, Stage, StageEvent, StageOutcome,
};
use conveyor_core::domain::run::RunEvent;
use conveyor_core::domain::trigger::{BuildEvent, TriggerEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterError;
use crate::repository::{RepositoryError, RunRepository};
use crate::service::approval::{ApprovalGate, WaitOutcome};
use crate::service::deployer::{ClusterDeployer, DeployError};
use crate::service::propagator::{PropagationError, PropagationResult, TagPropagator};
use crate::vcs::{VcsClient, VcsError};

const EVENT_BUFFER: usize = 256;

/// Static description of the single pipeline this coordinator drives
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub app_repo: String,
    pub app_branch: String,
    pub config_repo: String,
    pub config_branch: String,
    /// Descriptor holding the image reference, relative to the config repository
    pub descriptor_path: PathBuf,
    /// Descriptor files applied by the CD pipeline, in order
    pub manifests: Vec<PathBuf>,
    pub image_field: ImageField,
    pub deployment_name: String,
    /// Image every build artifact must carry (e.g. `registry.example.com/org/app`)
    pub image_repository: String,
    /// Zero disables the approval gate
    pub required_approvals: u32,
    pub approval_timeout: Duration,
    pub rollout_timeout: Duration,
    /// Root for per-run checkouts of the configuration repository
    pub workspace: PathBuf,
}

impl PipelineSettings {
    fn cd_workspace(&self) -> PathBuf {
        self.workspace.join("cd")
    }

    fn ci_workspace(&self, run_id: Uuid) -> PathBuf {
        self.workspace.join("ci").join(run_id.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {existing} is already active for {key}")]
    RunConflict { existing: Uuid, key: String },

    #[error("run {id} already finished as {status}")]
    AlreadyTerminal { id: Uuid, status: RunStatus },

    #[error("a push to {repository} needs a build artifact; send a build event instead")]
    MissingArtifact { repository: String },

    #[error(transparent)]
    InvalidArtifact(#[from] ArtifactError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What a run is exclusive on
#[derive(Debug, Clone, PartialEq, Eq)]
enum RunKey {
    Deployment(String),
    Tag(String),
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKey::Deployment(name) => write!(f, "deployment {}", name),
            RunKey::Tag(image) => write!(f, "image {}", image),
        }
    }
}

struct ActiveRun {
    key: RunKey,
    cancel: CancellationToken,
}

/// Repository URLs compare equal regardless of a trailing `.git` or `/`
fn same_repository(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> &str {
        let url = url.trim().trim_end_matches('/');
        url.strip_suffix(".git").unwrap_or(url)
    }
    normalize(a) == normalize(b)
}

pub struct Coordinator {
    settings: PipelineSettings,
    runs: Arc<dyn RunRepository>,
    config_vcs: Arc<VcsClient>,
    propagator: TagPropagator,
    deployer: ClusterDeployer,
    gate: Arc<ApprovalGate>,
    events: broadcast::Sender<RunEvent>,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
}

impl Coordinator {
    pub fn new(
        settings: PipelineSettings,
        runs: Arc<dyn RunRepository>,
        config_vcs: Arc<VcsClient>,
        deployer: ClusterDeployer,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        let propagator = TagPropagator::new(
            config_vcs.clone(),
            settings.config_repo.clone(),
            settings.image_field.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            settings,
            runs,
            config_vcs,
            propagator,
            deployer,
            gate,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Marks runs left unfinished by a previous process as failed
    pub async fn recover_interrupted(&self) -> Result<usize, CoordinatorError> {
        let mut recovered = 0;

        for mut run in self.runs.list_all().await? {
            if run.is_terminal() {
                continue;
            }

            warn!("Run {} was interrupted in {}, marking failed", run.id, run.status);
            let reason = FailureReason::Internal {
                message: "interrupted by orchestrator restart".to_string(),
            };
            if run.fail(reason).is_ok() {
                self.runs.update(&run).await?;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Routes a repository push to the pipeline it concerns
    ///
    /// Pushes to the configuration branch start a CD run. Pushes to the
    /// application branch are refused (they need a build artifact), and
    /// anything else is ignored with `Ok(None)`.
    pub async fn handle_trigger(
        self: &Arc<Self>,
        event: TriggerEvent,
    ) -> Result<Option<PipelineRun>, CoordinatorError> {
        if same_repository(&event.repository, &self.settings.config_repo)
            && event.branch == self.settings.config_branch
        {
            info!(
                "Config repository {} pushed at {}",
                event.repository, event.commit_sha
            );
            let run = self
                .launch(PipelineKind::Cd, None, Some(event.commit_sha))
                .await?;
            return Ok(Some(run));
        }

        if same_repository(&event.repository, &self.settings.app_repo)
            && event.branch == self.settings.app_branch
        {
            return Err(CoordinatorError::MissingArtifact {
                repository: event.repository,
            });
        }

        debug!(
            "Ignoring push to {}@{}",
            event.repository, event.branch
        );
        Ok(None)
    }

    /// Starts a CI run for a finished build of the application repository
    pub async fn handle_build(
        self: &Arc<Self>,
        event: BuildEvent,
    ) -> Result<Option<PipelineRun>, CoordinatorError> {
        let trigger = &event.trigger;
        if !same_repository(&trigger.repository, &self.settings.app_repo)
            || trigger.branch != self.settings.app_branch
        {
            debug!(
                "Ignoring build of {}@{}",
                trigger.repository, trigger.branch
            );
            return Ok(None);
        }

        let commit_sha = trigger.commit_sha.clone();
        let run = self
            .launch(PipelineKind::Ci, Some(event.artifact), Some(commit_sha))
            .await?;
        Ok(Some(run))
    }

    /// Replays the CI pipeline with an earlier tag of the configured image
    pub async fn rollback(self: &Arc<Self>, tag: &str) -> Result<PipelineRun, CoordinatorError> {
        let artifact = BuildArtifact::new(
            self.settings.app_repo.clone(),
            self.settings.image_repository.clone(),
            tag,
        );
        artifact.validate()?;

        info!("Rollback requested to {}", artifact.image_ref());
        self.launch(PipelineKind::Ci, Some(artifact), None).await
    }

    /// Creates a run and spawns its execution
    pub async fn launch(
        self: &Arc<Self>,
        kind: PipelineKind,
        artifact: Option<BuildArtifact>,
        commit_sha: Option<String>,
    ) -> Result<PipelineRun, CoordinatorError> {
        let key = match (kind, &artifact) {
            (PipelineKind::Cd, _) => RunKey::Deployment(self.settings.deployment_name.clone()),
            (PipelineKind::Ci, Some(artifact)) => RunKey::Tag(artifact.image_ref()),
            (PipelineKind::Ci, None) => {
                return Err(CoordinatorError::MissingArtifact {
                    repository: self.settings.app_repo.clone(),
                });
            }
        };

        let mut run = PipelineRun::new(kind);
        run.artifact = artifact;
        run.commit_sha = commit_sha;

        let cancel = CancellationToken::new();
        self.claim(run.id, key, cancel.clone())?;

        if let Err(err) = self.runs.insert(&run).await {
            self.release(run.id);
            return Err(err.into());
        }

        info!("Launched {} run {}", kind, run.id);
        self.publish(RunEvent::Created {
            run_id: run.id,
            kind,
        });

        tokio::spawn(self.clone().execute(run.clone(), cancel));
        Ok(run)
    }

    fn claim(&self, id: Uuid, key: RunKey, cancel: CancellationToken) -> Result<(), CoordinatorError> {
        let mut active = self.active.lock().unwrap();

        if let Some((existing, _)) = active.iter().find(|(_, run)| run.key == key) {
            return Err(CoordinatorError::RunConflict {
                existing: *existing,
                key: key.to_string(),
            });
        }

        active.insert(id, ActiveRun { key, cancel });
        Ok(())
    }

    /// Number of runs currently executing
    pub fn active_runs(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn release(&self, id: Uuid) {
        self.active.lock().unwrap().remove(&id);
    }

    fn publish(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_status(&self, id: Uuid) -> Result<PipelineRun, CoordinatorError> {
        self.runs
            .find_by_id(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    pub async fn list_runs(&self) -> Result<Vec<PipelineRun>, CoordinatorError> {
        Ok(self.runs.list_all().await?)
    }

    /// True when a CD run was already started for `commit_sha`, by any trigger
    pub async fn has_cd_run_for(&self, commit_sha: &str) -> Result<bool, CoordinatorError> {
        let runs = self.runs.list_all().await?;
        Ok(runs.iter().any(|run| {
            run.kind == PipelineKind::Cd && run.commit_sha.as_deref() == Some(commit_sha)
        }))
    }

    /// Stage-event log of a run
    pub async fn events(&self, id: Uuid) -> Result<Vec<StageEvent>, CoordinatorError> {
        Ok(self.get_status(id).await?.events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Requests cancellation of an active run
    pub async fn cancel(&self, id: Uuid) -> Result<(), CoordinatorError> {
        let token = self
            .active
            .lock()
            .unwrap()
            .get(&id)
            .map(|run| run.cancel.clone());

        if let Some(token) = token {
            info!("Cancelling run {}", id);
            token.cancel();
            return Ok(());
        }

        let run = self.get_status(id).await?;
        Err(CoordinatorError::AlreadyTerminal {
            id,
            status: run.status,
        })
    }

    /// Waits until the run reaches a terminal state
    pub async fn wait(&self, id: Uuid) -> Result<PipelineRun, CoordinatorError> {
        let mut events = self.subscribe();

        loop {
            let run = self.get_status(id).await?;
            if run.is_terminal() {
                return Ok(run);
            }

            loop {
                match events.recv().await {
                    Ok(RunEvent::StatusChanged { run_id, status, .. })
                        if run_id == id && status.is_terminal() =>
                    {
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CoordinatorError::NotFound(id));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(self: Arc<Self>, mut run: PipelineRun, cancel: CancellationToken) {
        let plan = Stage::plan(run.kind, self.settings.required_approvals > 0);
        self.set_status(&mut run, RunStatus::Running).await;

        let mut failure = None;

        for stage in plan {
            if cancel.is_cancelled() {
                failure = Some(FailureReason::Cancelled);
                break;
            }

            run.current_stage = Some(stage);
            self.persist(&run).await;
            debug!("Run {} entering {}", run.id, stage);

            let started_at = Utc::now();
            let result = self.run_stage(stage, &mut run, &cancel).await;

            let (outcome, detail) = match &result {
                Ok(detail) => (StageOutcome::Succeeded, detail.clone()),
                Err(FailureReason::Cancelled) => (StageOutcome::Cancelled, None),
                Err(reason) if reason.run_status() == RunStatus::Cancelled => {
                    (StageOutcome::Cancelled, Some(reason.to_string()))
                }
                Err(reason) => (StageOutcome::Failed, Some(reason.to_string())),
            };

            let event = StageEvent {
                stage,
                started_at,
                ended_at: Utc::now(),
                outcome,
                detail,
            };
            run.record_stage(event.clone());
            self.publish(RunEvent::StageCompleted {
                run_id: run.id,
                event,
            });

            if let Err(reason) = result {
                warn!("Run {} stopped at {}: {}", run.id, stage, reason);
                failure = Some(reason);
                break;
            }
        }

        if run.kind == PipelineKind::Ci {
            let workspace = self.settings.ci_workspace(run.id);
            if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
                debug!("Could not remove {}: {}", workspace.display(), e);
            }
        }

        self.finish(&mut run, failure).await;
    }

    async fn run_stage(
        &self,
        stage: Stage,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FailureReason> {
        match stage {
            Stage::BuildReferenceCheck => self.check_build_reference(run),
            Stage::TagPropagate => self.propagate_tag(run, cancel).await,
            Stage::ApprovalGate => self.await_approval(run, cancel).await,
            Stage::Apply => self.apply_manifests(cancel).await,
            Stage::WaitForRollout => self.verify_rollout(cancel).await,
        }
    }

    fn check_build_reference(&self, run: &PipelineRun) -> Result<Option<String>, FailureReason> {
        let artifact = run.artifact.as_ref().ok_or_else(|| FailureReason::InvalidArtifact {
            message: "run has no build artifact".to_string(),
        })?;

        artifact.validate().map_err(|e| FailureReason::InvalidArtifact {
            message: e.to_string(),
        })?;

        if artifact.image != self.settings.image_repository {
            let err = ArtifactError::UnexpectedImage {
                expected: self.settings.image_repository.clone(),
                actual: artifact.image.clone(),
            };
            return Err(FailureReason::InvalidArtifact {
                message: err.to_string(),
            });
        }

        Ok(Some(artifact.image_ref()))
    }

    async fn propagate_tag(
        &self,
        run: &PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FailureReason> {
        let artifact = run.artifact.as_ref().ok_or_else(|| FailureReason::Internal {
            message: "tag propagation without artifact".to_string(),
        })?;

        let result = self
            .propagator
            .propagate(
                &self.settings.ci_workspace(run.id),
                &self.settings.descriptor_path,
                &artifact.image_ref(),
                cancel,
            )
            .await
            .map_err(propagation_failure)?;

        let detail = match result {
            PropagationResult::Committed {
                revision,
                previous,
                attempts,
            } => format!(
                "committed {} replacing {} after {} attempt(s)",
                revision, previous, attempts
            ),
            PropagationResult::Unchanged { current } => {
                format!("descriptor already at {}", current)
            }
        };
        Ok(Some(detail))
    }

    async fn await_approval(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FailureReason> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.settings.approval_timeout).map_err(|e| {
                FailureReason::Internal {
                    message: format!("invalid approval timeout: {}", e),
                }
            })?;

        let request = self
            .gate
            .request_approval(run.id, self.settings.required_approvals, deadline);
        run.approval_id = Some(request.id);
        self.set_status(run, RunStatus::AwaitingApproval).await;

        let outcome = self.gate.await_decision(request.id, cancel).await;
        let decided = self.gate.archive(request.id);

        let request = match outcome {
            Ok(WaitOutcome::Decided(request)) => request,
            Ok(WaitOutcome::Cancelled) => return Err(FailureReason::Cancelled),
            Err(e) => match decided {
                Some(request) => {
                    debug!("Approval wait ended with {}, using archived request", e);
                    request
                }
                None => {
                    return Err(FailureReason::Internal {
                        message: e.to_string(),
                    });
                }
            },
        };

        match request.state {
            ApprovalState::Approved => {
                self.set_status(run, RunStatus::Running).await;
                let approvers: Vec<_> = request.approvals.iter().cloned().collect();
                Ok(Some(format!("approved by {}", approvers.join(", "))))
            }
            ApprovalState::Rejected => Err(FailureReason::ApprovalRejected {
                approver: request.rejected_by.unwrap_or_default(),
            }),
            ApprovalState::Expired | ApprovalState::Pending => Err(FailureReason::ApprovalExpired {
                received: request.approvals.len(),
                required: request.required,
            }),
            ApprovalState::Withdrawn => Err(FailureReason::Cancelled),
        }
    }

    /// Syncs the configuration repository and applies the manifests it holds now
    async fn apply_manifests(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FailureReason> {
        let workspace = self.settings.cd_workspace();
        let revision = self
            .config_vcs
            .sync(&self.settings.config_repo, &workspace, cancel)
            .await
            .map_err(vcs_failure)?;

        let mut descriptors: Vec<DeploymentDescriptor> = Vec::new();
        for manifest in &self.settings.manifests {
            let source = tokio::fs::read_to_string(workspace.join(manifest))
                .await
                .map_err(|e| FailureReason::DescriptorInvalid {
                    message: format!("{}: {}", manifest.display(), e),
                })?;
            let set = DescriptorSet::parse(&source).map_err(descriptor_failure)?;
            descriptors.extend(set.descriptors().map_err(descriptor_failure)?);
        }

        if descriptors.is_empty() {
            return Err(FailureReason::DescriptorInvalid {
                message: "no descriptors to apply".to_string(),
            });
        }

        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }

        let report = self
            .deployer
            .apply(&descriptors)
            .await
            .map_err(cluster_failure)?;

        let image = descriptors
            .iter()
            .find(|d| d.name == self.settings.deployment_name && d.image.is_some())
            .and_then(|d| d.image.clone())
            .unwrap_or_else(|| "unknown image".to_string());

        Ok(Some(format!(
            "applied {} at {} ({})",
            report.applied.join(", "),
            revision,
            image
        )))
    }

    async fn verify_rollout(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FailureReason> {
        let deployment = &self.settings.deployment_name;
        let status = self
            .deployer
            .wait_for_rollout(deployment, self.settings.rollout_timeout, cancel)
            .await
            .map_err(|e| match e {
                DeployError::Cancelled => FailureReason::Cancelled,
                DeployError::Cluster(e) => cluster_failure(e),
            })?;

        if !status.terminal {
            return Err(FailureReason::RolloutTimeout {
                deployment: deployment.clone(),
                last_status: status,
            });
        }

        Ok(Some(status.to_string()))
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn set_status(&self, run: &mut PipelineRun, status: RunStatus) {
        if let Err(e) = run.transition(status) {
            error!("{}", e);
            return;
        }

        self.persist(run).await;
        self.publish(RunEvent::StatusChanged {
            run_id: run.id,
            status,
            failure: None,
        });
    }

    async fn finish(&self, run: &mut PipelineRun, failure: Option<FailureReason>) {
        let result = match failure {
            Some(reason) => run.fail(reason),
            None => run.transition(RunStatus::Succeeded),
        };
        if let Err(e) = result {
            error!("{}", e);
        }

        self.persist(run).await;
        self.release(run.id);

        info!("Run {} finished: {}", run.id, run.status);
        self.publish(RunEvent::StatusChanged {
            run_id: run.id,
            status: run.status,
            failure: run.failure.clone(),
        });
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.runs.update(run).await {
            error!("Failed to persist run {}: {}", run.id, e);
        }
    }
}

fn vcs_failure(err: VcsError) -> FailureReason {
    let message = err.to_string();
    match err {
        VcsError::RemoteUnreachable { .. } => FailureReason::RemoteUnreachable { message },
        VcsError::ConcurrentUpdateConflict { .. } => {
            FailureReason::ConcurrentUpdateConflict { message }
        }
        VcsError::Cancelled => FailureReason::Cancelled,
        VcsError::Edit(_) => FailureReason::DescriptorInvalid { message },
        VcsError::Backend(_) => FailureReason::Internal { message },
    }
}

fn descriptor_failure(err: DescriptorError) -> FailureReason {
    let message = err.to_string();
    if err.is_field_not_found() {
        FailureReason::DescriptorFieldNotFound { message }
    } else {
        FailureReason::DescriptorInvalid { message }
    }
}

fn propagation_failure(err: PropagationError) -> FailureReason {
    match err {
        PropagationError::Vcs(e) => vcs_failure(e),
        PropagationError::Descriptor(e) => descriptor_failure(e),
    }
}

fn cluster_failure(err: ClusterError) -> FailureReason {
    let message = err.to_string();
    match err {
        ClusterError::Rejected { .. } => FailureReason::ApplyRejected { message },
        ClusterError::NotFound(_) | ClusterError::Unavailable(_) => {
            FailureReason::ClusterUnavailable { message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, RolloutMode};
    use crate::repository::InMemoryRunRepository;
    use crate::vcs::memory::InMemoryGit;

    const APP_REPO: &str = "https://git.example.com/org/app.git";
    const CONFIG_REPO: &str = "mem://org/deploy-config";
    const IMAGE: &str = "org/app";
    const DEPLOYMENT: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: app
          image: org/app:41
          ports:
            - containerPort: 8080
";
    const SERVICE: &str = "\
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
      targetPort: 8080
";

    struct Harness {
        coordinator: Arc<Coordinator>,
        git: Arc<InMemoryGit>,
        cluster: Arc<InMemoryCluster>,
        gate: Arc<ApprovalGate>,
        _workspace: tempfile::TempDir,
    }

    fn harness(mode: RolloutMode, required_approvals: u32) -> Harness {
        let git = Arc::new(InMemoryGit::new());
        git.seed(
            CONFIG_REPO,
            [("k8s/deployment.yaml", DEPLOYMENT), ("k8s/service.yaml", SERVICE)],
        );
        let cluster = Arc::new(InMemoryCluster::new(mode));
        let gate = Arc::new(ApprovalGate::new());
        let workspace = tempfile::tempdir().unwrap();

        let settings = PipelineSettings {
            app_repo: APP_REPO.to_string(),
            app_branch: "main".to_string(),
            config_repo: CONFIG_REPO.to_string(),
            config_branch: "main".to_string(),
            descriptor_path: PathBuf::from("k8s/deployment.yaml"),
            manifests: vec![
                PathBuf::from("k8s/deployment.yaml"),
                PathBuf::from("k8s/service.yaml"),
            ],
            image_field: ImageField::deployment(
                "web",
                "spec.template.spec.containers[name=app].image".parse().unwrap(),
            ),
            deployment_name: "web".to_string(),
            image_repository: IMAGE.to_string(),
            required_approvals,
            approval_timeout: Duration::from_secs(600),
            rollout_timeout: Duration::from_secs(2),
            workspace: workspace.path().to_path_buf(),
        };

        let vcs = Arc::new(VcsClient::new(git.clone(), "main"));
        let deployer =
            ClusterDeployer::new(cluster.clone()).with_poll_interval(Duration::from_millis(10));
        let coordinator = Arc::new(Coordinator::new(
            settings,
            Arc::new(InMemoryRunRepository::new()),
            vcs,
            deployer,
            gate.clone(),
        ));

        Harness {
            coordinator,
            git,
            cluster,
            gate,
            _workspace: workspace,
        }
    }

    fn build_event(tag: &str) -> BuildEvent {
        BuildEvent {
            trigger: TriggerEvent {
                repository: APP_REPO.to_string(),
                branch: "main".to_string(),
                commit_sha: "a1b2c3d".to_string(),
            },
            artifact: BuildArtifact::new(APP_REPO, IMAGE, tag),
        }
    }

    fn config_push(commit_sha: &str) -> TriggerEvent {
        TriggerEvent {
            repository: format!("{}/", CONFIG_REPO),
            branch: "main".to_string(),
            commit_sha: commit_sha.to_string(),
        }
    }

    fn image_at_head(git: &InMemoryGit) -> String {
        let head = git.file_at_head(CONFIG_REPO, "k8s/deployment.yaml").unwrap();
        let set = DescriptorSet::parse(&head).unwrap();
        let field = ImageField::deployment(
            "web",
            "spec.template.spec.containers[name=app].image".parse().unwrap(),
        );
        set.image_reference(&field).unwrap().to_string()
    }

    fn stages(run: &PipelineRun) -> Vec<(Stage, StageOutcome)> {
        run.events.iter().map(|e| (e.stage, e.outcome)).collect()
    }

    async fn pending_approval(gate: &ApprovalGate) -> Uuid {
        loop {
            if let Some(request) = gate.list_pending().first() {
                return request.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_build_to_rollout_end_to_end() {
        let h = harness(RolloutMode::Step(1), 0);

        let ci = h
            .coordinator
            .handle_build(build_event("42"))
            .await
            .unwrap()
            .unwrap();
        let ci = h.coordinator.wait(ci.id).await.unwrap();

        assert_eq!(ci.status, RunStatus::Succeeded, "{:?}", ci.failure);
        assert_eq!(
            stages(&ci),
            vec![
                (Stage::BuildReferenceCheck, StageOutcome::Succeeded),
                (Stage::TagPropagate, StageOutcome::Succeeded),
            ]
        );
        assert_eq!(image_at_head(&h.git), "org/app:42");

        let revision = h.git.history(CONFIG_REPO).last().unwrap().revision.clone();
        let cd = h
            .coordinator
            .handle_trigger(config_push(&revision))
            .await
            .unwrap()
            .unwrap();
        let cd = h.coordinator.wait(cd.id).await.unwrap();

        assert_eq!(cd.status, RunStatus::Succeeded, "{:?}", cd.failure);
        assert_eq!(cd.last_successful_stage, Some(Stage::WaitForRollout));
        assert_eq!(
            stages(&cd),
            vec![
                (Stage::Apply, StageOutcome::Succeeded),
                (Stage::WaitForRollout, StageOutcome::Succeeded),
            ]
        );

        let applied = h.cluster.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].image.as_deref(), Some("org/app:42"));
        assert_eq!(h.coordinator.list_runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_build_approval_and_full_rollout() {
        let h = harness(RolloutMode::Step(1), 1);

        let ci = h
            .coordinator
            .handle_build(build_event("42"))
            .await
            .unwrap()
            .unwrap();
        let ci = h.coordinator.wait(ci.id).await.unwrap();
        assert_eq!(ci.status, RunStatus::Succeeded, "{:?}", ci.failure);
        assert_eq!(image_at_head(&h.git), "org/app:42");

        let revision = h.git.history(CONFIG_REPO).last().unwrap().revision.clone();
        let cd = h
            .coordinator
            .handle_trigger(config_push(&revision))
            .await
            .unwrap()
            .unwrap();

        let approval = pending_approval(&h.gate).await;
        assert!(h.cluster.applied().is_empty());
        let decided = h.gate.record_approval(approval, "alice").unwrap();
        assert_eq!(decided.state, ApprovalState::Approved);

        let cd = h.coordinator.wait(cd.id).await.unwrap();
        assert_eq!(cd.status, RunStatus::Succeeded, "{:?}", cd.failure);
        assert_eq!(cd.commit_sha.as_deref(), Some(revision.as_str()));
        assert_eq!(
            stages(&cd),
            vec![
                (Stage::ApprovalGate, StageOutcome::Succeeded),
                (Stage::Apply, StageOutcome::Succeeded),
                (Stage::WaitForRollout, StageOutcome::Succeeded),
            ]
        );
        assert_eq!(cd.events[0].detail.as_deref(), Some("approved by alice"));

        let rollout = cd.events[2].detail.as_deref().unwrap_or_default();
        assert!(rollout.starts_with("3/3 ready"), "{}", rollout);
        assert_eq!(h.cluster.status_polls(), 3);
        assert_eq!(h.cluster.applied()[0].image.as_deref(), Some("org/app:42"));
    }

    #[tokio::test]
    async fn test_unavailable_cluster_fails_apply() {
        let h = harness(RolloutMode::Instant, 0);
        h.cluster.set_unavailable(true);

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let cd = h.coordinator.wait(cd.id).await.unwrap();

        assert_eq!(cd.status, RunStatus::Failed);
        assert!(matches!(
            cd.failure,
            Some(FailureReason::ClusterUnavailable { .. })
        ));
        assert_eq!(stages(&cd), vec![(Stage::Apply, StageOutcome::Failed)]);
    }

    #[tokio::test]
    async fn test_apply_rejection_never_polls_rollout() {
        let h = harness(RolloutMode::Instant, 0);
        h.cluster.reject("web");

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let cd = h.coordinator.wait(cd.id).await.unwrap();

        assert_eq!(cd.status, RunStatus::Failed);
        assert!(matches!(cd.failure, Some(FailureReason::ApplyRejected { .. })));
        assert_eq!(stages(&cd), vec![(Stage::Apply, StageOutcome::Failed)]);
        assert_eq!(h.cluster.status_polls(), 0);
    }

    #[tokio::test]
    async fn test_stalled_rollout_times_out() {
        let h = harness(RolloutMode::Stalled, 0);

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let cd = h.coordinator.wait(cd.id).await.unwrap();

        assert_eq!(cd.status, RunStatus::Failed);
        match cd.failure {
            Some(FailureReason::RolloutTimeout {
                deployment,
                last_status,
            }) => {
                assert_eq!(deployment, "web");
                assert_eq!(last_status.desired_replicas, 3);
                assert_eq!(last_status.ready_replicas, 0);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(cd.last_successful_stage, Some(Stage::Apply));
    }

    #[tokio::test]
    async fn test_unexpected_image_fails_reference_check() {
        let h = harness(RolloutMode::Instant, 0);
        let mut event = build_event("42");
        event.artifact = BuildArtifact::new(APP_REPO, "org/other", "42");

        let ci = h.coordinator.handle_build(event).await.unwrap().unwrap();
        let ci = h.coordinator.wait(ci.id).await.unwrap();

        assert!(matches!(ci.failure, Some(FailureReason::InvalidArtifact { .. })));
        assert_eq!(
            stages(&ci),
            vec![(Stage::BuildReferenceCheck, StageOutcome::Failed)]
        );
        assert_eq!(h.git.history(CONFIG_REPO).len(), 1);
    }

    #[tokio::test]
    async fn test_approval_quorum_then_deploy() {
        let h = harness(RolloutMode::Instant, 2);

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();

        let approval = pending_approval(&h.gate).await;
        let awaiting = h.coordinator.get_status(cd.id).await.unwrap();
        assert_eq!(awaiting.status, RunStatus::AwaitingApproval);
        assert_eq!(awaiting.approval_id, Some(approval));

        h.gate.record_approval(approval, "alice").unwrap();
        h.gate.record_approval(approval, "bob").unwrap();

        let cd = h.coordinator.wait(cd.id).await.unwrap();
        assert_eq!(cd.status, RunStatus::Succeeded, "{:?}", cd.failure);
        assert_eq!(
            cd.events[0].detail.as_deref(),
            Some("approved by alice, bob")
        );
    }

    #[tokio::test]
    async fn test_rejection_fails_run() {
        let h = harness(RolloutMode::Instant, 1);

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let approval = pending_approval(&h.gate).await;
        h.gate.record_rejection(approval, "carol").unwrap();

        let cd = h.coordinator.wait(cd.id).await.unwrap();
        assert_eq!(cd.status, RunStatus::Failed);
        assert_eq!(
            cd.failure,
            Some(FailureReason::ApprovalRejected {
                approver: "carol".to_string()
            })
        );
        assert!(h.cluster.applied().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_approval() {
        let h = harness(RolloutMode::Instant, 1);

        let cd = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let approval = pending_approval(&h.gate).await;

        h.coordinator.cancel(cd.id).await.unwrap();
        let cd = h.coordinator.wait(cd.id).await.unwrap();

        assert_eq!(cd.status, RunStatus::Cancelled);
        assert_eq!(cd.failure, Some(FailureReason::Cancelled));
        assert_eq!(
            stages(&cd),
            vec![(Stage::ApprovalGate, StageOutcome::Cancelled)]
        );
        assert!(h.gate.list_pending().is_empty());
        assert!(h.gate.get(approval).is_some());

        assert!(matches!(
            h.coordinator.cancel(cd.id).await,
            Err(CoordinatorError::AlreadyTerminal {
                status: RunStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_second_cd_run_conflicts_while_first_is_active() {
        let h = harness(RolloutMode::Instant, 1);

        let first = h
            .coordinator
            .handle_trigger(config_push("c0ffee"))
            .await
            .unwrap()
            .unwrap();
        let err = h
            .coordinator
            .handle_trigger(config_push("c0ffef"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::RunConflict { existing, .. } if existing == first.id
        ));

        h.coordinator.cancel(first.id).await.unwrap();
        h.coordinator.wait(first.id).await.unwrap();
        assert!(
            h.coordinator
                .handle_trigger(config_push("c0ffef"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_trigger_routing() {
        let h = harness(RolloutMode::Instant, 0);

        let other_branch = TriggerEvent {
            repository: CONFIG_REPO.to_string(),
            branch: "feature".to_string(),
            commit_sha: "c0ffee".to_string(),
        };
        assert!(h.coordinator.handle_trigger(other_branch).await.unwrap().is_none());

        let app_push = TriggerEvent {
            repository: "https://git.example.com/org/app".to_string(),
            branch: "main".to_string(),
            commit_sha: "a1b2c3d".to_string(),
        };
        assert!(matches!(
            h.coordinator.handle_trigger(app_push).await,
            Err(CoordinatorError::MissingArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_commits_older_tag() {
        let h = harness(RolloutMode::Instant, 0);

        let run = h.coordinator.rollback("40").await.unwrap();
        let run = h.coordinator.wait(run.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.failure);
        assert_eq!(run.artifact.unwrap().image_ref(), "org/app:40");
        assert_eq!(image_at_head(&h.git), "org/app:40");
        assert!(!h.coordinator.settings().ci_workspace(run.id).exists());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let h = harness(RolloutMode::Instant, 0);
        let id = Uuid::new_v4();

        assert!(matches!(
            h.coordinator.get_status(id).await,
            Err(CoordinatorError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            h.coordinator.cancel(id).await,
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let repo = Arc::new(InMemoryRunRepository::new());
        let mut stuck = PipelineRun::new(PipelineKind::Cd);
        stuck.transition(RunStatus::Running).unwrap();
        repo.insert(&stuck).await.unwrap();

        let h = harness(RolloutMode::Instant, 0);
        let coordinator = Coordinator::new(
            h.coordinator.settings().clone(),
            repo.clone(),
            Arc::new(VcsClient::new(h.git.clone(), "main")),
            ClusterDeployer::new(h.cluster.clone()),
            h.gate.clone(),
        );

        assert_eq!(coordinator.recover_interrupted().await.unwrap(), 1);
        let stored = repo.find_by_id(stuck.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }
}
