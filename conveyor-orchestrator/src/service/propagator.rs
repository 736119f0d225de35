//! Tag Propagator
//!
//! Writes a new image reference into the deployment descriptor of the
//! configuration repository. The edit is structural (see
//! [`ImageField`]) and runs inside [`VcsClient::commit_and_push`], so a
//! rejected push re-runs it against the fresh remote state.

use conveyor_core::domain::descriptor::{DescriptorError, DescriptorSet, ImageField};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::vcs::{CommitOutcome, Revision, VcsClient, VcsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationResult {
    Committed {
        revision: Revision,
        previous: String,
        attempts: u32,
    },
    /// The descriptor already referenced the target image
    Unchanged { current: String },
}

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error(transparent)]
    Vcs(VcsError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl From<VcsError> for PropagationError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::Edit(source) => match source.downcast::<DescriptorError>() {
                Ok(descriptor) => PropagationError::Descriptor(*descriptor),
                Err(other) => PropagationError::Vcs(VcsError::Edit(other)),
            },
            other => PropagationError::Vcs(other),
        }
    }
}

pub struct TagPropagator {
    vcs: Arc<VcsClient>,
    repo_url: String,
    image_field: ImageField,
}

impl TagPropagator {
    pub fn new(
        vcs: Arc<VcsClient>,
        repo_url: impl Into<String>,
        image_field: ImageField,
    ) -> Self {
        Self {
            vcs,
            repo_url: repo_url.into(),
            image_field,
        }
    }

    /// Sets the image reference of `descriptor_path` to `target` and pushes it
    ///
    /// `workspace` is a checkout private to the caller; it is cloned on first use.
    pub async fn propagate(
        &self,
        workspace: &Path,
        descriptor_path: &Path,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<PropagationResult, PropagationError> {
        self.vcs.sync(&self.repo_url, workspace, cancel).await?;

        let previous = Mutex::new(String::new());
        let edit = |checkout: &Path| -> Result<Vec<PathBuf>, VcsError> {
            let file = checkout.join(descriptor_path);
            let source = std::fs::read_to_string(&file)?;

            let mut set = DescriptorSet::parse(&source).map_err(VcsError::edit)?;
            let update = set
                .set_image_reference(&self.image_field, target)
                .map_err(VcsError::edit)?;
            *previous.lock().unwrap() = update.previous;

            if !update.changed {
                return Ok(Vec::new());
            }

            std::fs::write(&file, set.source())?;
            Ok(vec![descriptor_path.to_path_buf()])
        };

        let message = format!(
            "Update {} {} image to {}",
            self.image_field.kind, self.image_field.name, target
        );

        let outcome = self
            .vcs
            .commit_and_push(&self.repo_url, workspace, &edit, &message, cancel)
            .await?;

        let previous = previous.into_inner().unwrap_or_default();

        match outcome {
            CommitOutcome::Committed { revision, attempts } => {
                info!(
                    "Propagated {} to {} at {} (was {})",
                    target,
                    descriptor_path.display(),
                    revision,
                    previous
                );
                Ok(PropagationResult::Committed {
                    revision,
                    previous,
                    attempts,
                })
            }
            CommitOutcome::Unchanged => {
                info!(
                    "{} already references {}, nothing to commit",
                    descriptor_path.display(),
                    target
                );
                Ok(PropagationResult::Unchanged { current: previous })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::memory::InMemoryGit;

    const REMOTE: &str = "mem://deploy-config";
    const DESCRIPTOR: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  template:
    spec:
      containers:
        - name: app
          image: org/app:41
        - name: proxy
          image: org/app:41
";

    fn image_field() -> ImageField {
        ImageField::deployment(
            "web",
            "spec.template.spec.containers[name=app].image".parse().unwrap(),
        )
    }

    fn propagator(git: Arc<InMemoryGit>) -> TagPropagator {
        let vcs = Arc::new(VcsClient::new(git, "main"));
        TagPropagator::new(vcs, REMOTE, image_field())
    }

    #[tokio::test]
    async fn test_propagate_rewrites_only_addressed_field() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("k8s/web.yaml", DESCRIPTOR)]);
        let dir = tempfile::tempdir().unwrap();

        let result = propagator(git.clone())
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:42", &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            result,
            PropagationResult::Committed { ref previous, attempts: 1, .. } if previous == "org/app:41"
        ));

        let head = git.file_at_head(REMOTE, "k8s/web.yaml").unwrap();
        let set = DescriptorSet::parse(&head).unwrap();
        assert_eq!(set.image_reference(&image_field()).unwrap(), "org/app:42");

        let proxy = ImageField::deployment(
            "web",
            "spec.template.spec.containers[name=proxy].image".parse().unwrap(),
        );
        assert_eq!(set.image_reference(&proxy).unwrap(), "org/app:41");
    }

    #[tokio::test]
    async fn test_committed_file_keeps_comments_and_literals() {
        let annotated = "\
# managed by the platform team
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      containers:
        - name: app
          image: 'org/app:41'  # rolled by the pipeline
          env:
            - name: VERBOSE
              value: 'yes'
      volumes:
        - name: config
          configMap:
            defaultMode: 0644
";
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("k8s/web.yaml", annotated)]);
        let dir = tempfile::tempdir().unwrap();

        propagator(git.clone())
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:42", &CancellationToken::new())
            .await
            .unwrap();

        let head = git.file_at_head(REMOTE, "k8s/web.yaml").unwrap();
        assert_eq!(head, annotated.replacen("'org/app:41'", "'org/app:42'", 1));
    }

    #[tokio::test]
    async fn test_propagate_twice_is_idempotent() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("k8s/web.yaml", DESCRIPTOR)]);
        let dir = tempfile::tempdir().unwrap();
        let propagator = propagator(git.clone());
        let cancel = CancellationToken::new();

        propagator
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:42", &cancel)
            .await
            .unwrap();
        let second = propagator
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:42", &cancel)
            .await
            .unwrap();

        assert_eq!(
            second,
            PropagationResult::Unchanged {
                current: "org/app:42".to_string()
            }
        );
        assert_eq!(git.history(REMOTE).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_field_is_reported() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("k8s/web.yaml", DESCRIPTOR)]);
        let dir = tempfile::tempdir().unwrap();

        let vcs = Arc::new(VcsClient::new(git.clone(), "main"));
        let field = ImageField::deployment(
            "web",
            "spec.template.spec.containers[name=sidecar].image".parse().unwrap(),
        );
        let err = TagPropagator::new(vcs, REMOTE, field)
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:42", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PropagationError::Descriptor(err) => assert!(err.is_field_not_found()),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(git.history(REMOTE).len(), 1);
    }

    #[tokio::test]
    async fn test_edit_lands_on_latest_remote_state() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(
            REMOTE,
            [("k8s/web.yaml", DESCRIPTOR), ("README.md", "config\n")],
        );
        let dir = tempfile::tempdir().unwrap();
        let propagator = propagator(git.clone());
        let cancel = CancellationToken::new();

        propagator.vcs.sync(REMOTE, dir.path(), &cancel).await.unwrap();
        git.commit_on_remote(REMOTE, "README.md", "config v2\n");

        let result = propagator
            .propagate(dir.path(), Path::new("k8s/web.yaml"), "org/app:43", &cancel)
            .await
            .unwrap();

        assert!(matches!(result, PropagationResult::Committed { .. }));
        assert_eq!(git.file_at_head(REMOTE, "README.md").as_deref(), Some("config v2\n"));
        let head = git.file_at_head(REMOTE, "k8s/web.yaml").unwrap();
        assert!(head.contains("org/app:43"));
    }
}
