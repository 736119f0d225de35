//! Orchestrator configuration
//!
//! Defines the pipeline the orchestrator drives (repositories, descriptor
//! location, approval and rollout bounds) and how it reaches git and the
//! cluster. Everything is read from `CONVEYOR_*` environment variables.

use anyhow::Context;
use conveyor_core::domain::descriptor::{FieldPath, ImageField};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::service::PipelineSettings;
use crate::service::approval::DEFAULT_ARCHIVE_CAPACITY;
use crate::vcs::RetrySettings;

/// Which cluster backend deploys manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    Kubectl,
    /// In-process cluster, for dry runs
    Memory,
}

impl FromStr for ClusterBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubectl" => Ok(ClusterBackend::Kubectl),
            "memory" => Ok(ClusterBackend::Memory),
            other => anyhow::bail!("unknown cluster backend '{}'", other),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Postgres URL for the run store; runs are kept in memory when unset
    pub database_url: Option<String>,

    pub app_repo: String,
    pub app_branch: String,
    pub config_repo: String,
    pub config_branch: String,

    /// Root directory for configuration repository checkouts
    pub workspace: PathBuf,

    /// Descriptor holding the image reference, relative to the config repository
    pub descriptor_path: PathBuf,

    /// Descriptors applied on deploy; defaults to the descriptor itself
    pub manifests: Vec<PathBuf>,

    pub deployment_name: String,

    /// Field path of the image reference inside the deployment document
    pub image_field: String,

    /// Image every build artifact must reference
    pub image_repository: String,

    /// Approvals needed before deploying (0 disables the gate)
    pub required_approvals: u32,
    pub approval_timeout: Duration,
    pub approval_sweep_interval: Duration,
    /// Closed approval requests kept readable through the API
    pub approval_history: usize,

    pub rollout_timeout: Duration,
    pub rollout_poll_interval: Duration,

    /// Commit-and-push attempts before giving up on a contended descriptor
    pub push_retries: u32,

    /// How often to poll the config repository head (zero disables polling)
    pub config_poll_interval: Duration,

    pub cluster_backend: ClusterBackend,
    pub kube_namespace: Option<String>,
    pub kube_context: Option<String>,

    pub git_author_name: String,
    pub git_author_email: String,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    env_optional(key).ok_or_else(|| anyhow::anyhow!("{} environment variable not set", key))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_number<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Splits a comma-separated path list, skipping blanks
fn parse_paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(
        app_repo: String,
        config_repo: String,
        image_repository: String,
        deployment_name: String,
    ) -> Self {
        let descriptor_path = PathBuf::from("deploy/deployment.yaml");

        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            app_repo,
            app_branch: "main".to_string(),
            config_repo,
            config_branch: "main".to_string(),
            workspace: std::env::temp_dir().join("conveyor"),
            manifests: vec![descriptor_path.clone()],
            descriptor_path,
            deployment_name,
            image_field: "spec.template.spec.containers[0].image".to_string(),
            image_repository,
            required_approvals: 0,
            approval_timeout: Duration::from_secs(3600),
            approval_sweep_interval: Duration::from_secs(5),
            approval_history: DEFAULT_ARCHIVE_CAPACITY,
            rollout_timeout: Duration::from_secs(300),
            rollout_poll_interval: Duration::from_secs(3),
            push_retries: 5,
            config_poll_interval: Duration::from_secs(30),
            cluster_backend: ClusterBackend::Kubectl,
            kube_namespace: None,
            kube_context: None,
            git_author_name: "Conveyor".to_string(),
            git_author_email: "conveyor@localhost".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Required:
    /// - CONVEYOR_APP_REPO, CONVEYOR_CONFIG_REPO
    /// - CONVEYOR_IMAGE_REPOSITORY, CONVEYOR_DEPLOYMENT_NAME
    ///
    /// Optional (seconds for durations):
    /// - CONVEYOR_BIND_ADDR (default: 0.0.0.0:8080), DATABASE_URL
    /// - CONVEYOR_APP_BRANCH, CONVEYOR_CONFIG_BRANCH (default: main)
    /// - CONVEYOR_WORKSPACE, CONVEYOR_DESCRIPTOR_PATH, CONVEYOR_MANIFESTS (comma-separated)
    /// - CONVEYOR_IMAGE_FIELD (default: spec.template.spec.containers[0].image)
    /// - CONVEYOR_REQUIRED_APPROVALS (default: 0), CONVEYOR_APPROVAL_TIMEOUT (default: 3600)
    /// - CONVEYOR_APPROVAL_HISTORY (default: 500)
    /// - CONVEYOR_ROLLOUT_TIMEOUT (default: 300), CONVEYOR_ROLLOUT_POLL_INTERVAL (default: 3)
    /// - CONVEYOR_PUSH_RETRIES (default: 5)
    /// - CONVEYOR_CONFIG_POLL_INTERVAL (default: 30, 0 disables)
    /// - CONVEYOR_CLUSTER_BACKEND (kubectl | memory), CONVEYOR_KUBE_NAMESPACE, CONVEYOR_KUBE_CONTEXT
    /// - CONVEYOR_GIT_AUTHOR_NAME, CONVEYOR_GIT_AUTHOR_EMAIL
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::new(
            env_required("CONVEYOR_APP_REPO")?,
            env_required("CONVEYOR_CONFIG_REPO")?,
            env_required("CONVEYOR_IMAGE_REPOSITORY")?,
            env_required("CONVEYOR_DEPLOYMENT_NAME")?,
        );

        let descriptor_path = env_optional("CONVEYOR_DESCRIPTOR_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.descriptor_path);

        let manifests = env_optional("CONVEYOR_MANIFESTS")
            .map(|list| parse_paths(&list))
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| vec![descriptor_path.clone()]);

        let cluster_backend = match env_optional("CONVEYOR_CLUSTER_BACKEND") {
            Some(value) => value.parse().context("Invalid CONVEYOR_CLUSTER_BACKEND")?,
            None => defaults.cluster_backend,
        };

        Ok(Self {
            bind_addr: env_string("CONVEYOR_BIND_ADDR", &defaults.bind_addr),
            database_url: env_optional("DATABASE_URL"),
            app_branch: env_string("CONVEYOR_APP_BRANCH", &defaults.app_branch),
            config_branch: env_string("CONVEYOR_CONFIG_BRANCH", &defaults.config_branch),
            workspace: env_optional("CONVEYOR_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace),
            descriptor_path,
            manifests,
            image_field: env_string("CONVEYOR_IMAGE_FIELD", &defaults.image_field),
            required_approvals: env_number("CONVEYOR_REQUIRED_APPROVALS", 0),
            approval_timeout: env_secs("CONVEYOR_APPROVAL_TIMEOUT", defaults.approval_timeout),
            approval_history: env_number("CONVEYOR_APPROVAL_HISTORY", defaults.approval_history),
            rollout_timeout: env_secs("CONVEYOR_ROLLOUT_TIMEOUT", defaults.rollout_timeout),
            rollout_poll_interval: env_secs(
                "CONVEYOR_ROLLOUT_POLL_INTERVAL",
                defaults.rollout_poll_interval,
            ),
            push_retries: env_number("CONVEYOR_PUSH_RETRIES", defaults.push_retries),
            config_poll_interval: env_secs(
                "CONVEYOR_CONFIG_POLL_INTERVAL",
                defaults.config_poll_interval,
            ),
            cluster_backend,
            kube_namespace: env_optional("CONVEYOR_KUBE_NAMESPACE"),
            kube_context: env_optional("CONVEYOR_KUBE_CONTEXT"),
            git_author_name: env_string("CONVEYOR_GIT_AUTHOR_NAME", &defaults.git_author_name),
            git_author_email: env_string("CONVEYOR_GIT_AUTHOR_EMAIL", &defaults.git_author_email),
            ..defaults
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("bind_addr '{}' is not a socket address", self.bind_addr);
        }

        for (name, value) in [
            ("app_repo", &self.app_repo),
            ("config_repo", &self.config_repo),
            ("app_branch", &self.app_branch),
            ("config_branch", &self.config_branch),
            ("deployment_name", &self.deployment_name),
            ("image_repository", &self.image_repository),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
        }

        self.image_field
            .parse::<FieldPath>()
            .with_context(|| format!("Invalid image field '{}'", self.image_field))?;

        if self.manifests.is_empty() {
            anyhow::bail!("at least one manifest is required");
        }

        if self.rollout_timeout.is_zero() {
            anyhow::bail!("rollout_timeout must be greater than 0");
        }

        if self.rollout_poll_interval.is_zero() {
            anyhow::bail!("rollout_poll_interval must be greater than 0");
        }

        if self.required_approvals > 0 && self.approval_timeout.is_zero() {
            anyhow::bail!("approval_timeout must be greater than 0 when approvals are required");
        }

        if self.push_retries == 0 {
            anyhow::bail!("push_retries must be greater than 0");
        }

        Ok(())
    }

    /// Pipeline description handed to the coordinator
    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        let path: FieldPath = self
            .image_field
            .parse()
            .with_context(|| format!("Invalid image field '{}'", self.image_field))?;

        Ok(PipelineSettings {
            app_repo: self.app_repo.clone(),
            app_branch: self.app_branch.clone(),
            config_repo: self.config_repo.clone(),
            config_branch: self.config_branch.clone(),
            descriptor_path: self.descriptor_path.clone(),
            manifests: self.manifests.clone(),
            image_field: ImageField::deployment(self.deployment_name.clone(), path),
            deployment_name: self.deployment_name.clone(),
            image_repository: self.image_repository.clone(),
            required_approvals: self.required_approvals,
            approval_timeout: self.approval_timeout,
            rollout_timeout: self.rollout_timeout,
            workspace: self.workspace.clone(),
        })
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            push_attempts: self.push_retries,
            ..RetrySettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "file:///srv/git/app.git".to_string(),
            "file:///srv/git/deploy-config.git".to_string(),
            "localhost:5000/app".to_string(),
            "app".to_string(),
        )
    }
}
