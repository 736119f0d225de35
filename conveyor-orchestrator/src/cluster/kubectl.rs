//! Cluster backend using the `kubectl` CLI

use super::{ClusterApi, ClusterError};
use async_trait::async_trait;
use conveyor_core::domain::descriptor::DeploymentDescriptor;
use conveyor_core::domain::rollout::{DeploymentCondition, DeploymentState};
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const UNAVAILABLE_MARKERS: &[&str] = &[
    "Unable to connect to the server",
    "connection refused",
    "i/o timeout",
    "TLS handshake timeout",
    "the server is currently unable to handle the request",
];

pub struct KubectlCluster {
    namespace: Option<String>,
    context: Option<String>,
}

impl KubectlCluster {
    pub fn new(namespace: Option<String>, context: Option<String>) -> Self {
        Self { namespace, context }
    }

    fn command(&self) -> Command {
        let mut command = Command::new("kubectl");
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        if let Some(namespace) = &self.namespace {
            command.arg("--namespace").arg(namespace);
        }
        command.kill_on_drop(true);
        command
    }
}

fn is_unavailable(stderr: &str) -> bool {
    UNAVAILABLE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

// Subset of the Deployment object returned by `kubectl get -o json`

#[derive(Debug, Deserialize)]
struct DeploymentObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatusObject,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    generation: i64,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentSpec {
    replicas: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatusObject {
    #[serde(default)]
    observed_generation: i64,
    #[serde(default)]
    replicas: u32,
    #[serde(default)]
    updated_replicas: u32,
    #[serde(default)]
    ready_replicas: u32,
    #[serde(default)]
    conditions: Vec<DeploymentCondition>,
}

impl From<DeploymentObject> for DeploymentState {
    fn from(object: DeploymentObject) -> Self {
        // Pods of the previous revision do not count until the controller
        // has observed the new spec and replaced them.
        let ready_replicas = if object.status.observed_generation < object.metadata.generation {
            0
        } else {
            object
                .status
                .ready_replicas
                .min(object.status.updated_replicas)
        };

        DeploymentState {
            desired_replicas: object.spec.replicas.unwrap_or(1),
            observed_replicas: object.status.replicas,
            ready_replicas,
            conditions: object.status.conditions,
        }
    }
}

fn parse_deployment(json: &str) -> Result<DeploymentState, ClusterError> {
    let object: DeploymentObject = serde_json::from_str(json)
        .map_err(|e| ClusterError::Unavailable(format!("unexpected kubectl output: {}", e)))?;
    Ok(object.into())
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    async fn apply(&self, descriptor: &DeploymentDescriptor) -> Result<(), ClusterError> {
        let manifest = descriptor.source();

        info!("Applying {} '{}'", descriptor.kind, descriptor.name);

        let mut child = self
            .command()
            .arg("apply")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClusterError::Unavailable(format!("failed to execute kubectl: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(manifest.as_bytes())
                .await
                .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("kubectl apply stdout: {}", stdout.trim());
        }

        if !output.status.success() {
            let message = stderr.trim().to_string();
            if is_unavailable(&message) {
                return Err(ClusterError::Unavailable(message));
            }
            return Err(ClusterError::Rejected {
                kind: descriptor.kind.clone(),
                name: descriptor.name.clone(),
                message,
            });
        }

        Ok(())
    }

    async fn deployment_status(&self, name: &str) -> Result<DeploymentState, ClusterError> {
        let output = self
            .command()
            .arg("get")
            .arg("deployment")
            .arg(name)
            .arg("-o")
            .arg("json")
            .output()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("failed to execute kubectl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("NotFound") {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            return Err(ClusterError::Unavailable(stderr));
        }

        parse_deployment(&String::from_utf8_lossy(&output.stdout))
    }
}
