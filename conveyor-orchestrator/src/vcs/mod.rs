//! Version-control client
//!
//! The only component with write access to the configuration repository.
//! Two concerns are layered here:
//! - [`GitBackend`]: primitive operations against a workspace and its remote
//! - [`VcsClient`]: bounded retries on top of a backend (exponential backoff
//!   for transport failures, rebase-and-reapply for rejected pushes)
//!
//! Concurrent writers to the same descriptor need no external lock: a writer
//! whose push is rejected re-bases onto the remote head and re-applies its
//! edit there, so the last committer wins without losing anyone's commit.

pub mod git;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use git::GitCli;

/// Commit identifier
pub type Revision = String;

/// Errors surfaced by a [`GitBackend`]
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network or remote-side failure worth retrying
    #[error("transient: {0}")]
    Transient(String),

    /// Anything retrying will not fix
    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the [`VcsClient`]
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("remote {remote} unreachable after {attempts} attempt(s): {message}")]
    RemoteUnreachable {
        remote: String,
        attempts: u32,
        message: String,
    },

    #[error("push to {remote} still rejected after {attempts} attempt(s)")]
    ConcurrentUpdateConflict { remote: String, attempts: u32 },

    #[error("failed to edit workspace: {0}")]
    Edit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("git operation failed: {0}")]
    Backend(#[from] BackendError),

    #[error("operation cancelled")]
    Cancelled,
}

impl VcsError {
    /// Wraps an error raised while mutating workspace files
    pub fn edit(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        VcsError::Edit(Box::new(err))
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::Edit(Box::new(err))
    }
}

/// Result of a push attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed(Revision),
    /// Remote head moved since our base (non-fast-forward)
    Rejected,
}

/// Result of [`VcsClient::commit_and_push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { revision: Revision, attempts: u32 },
    /// The edit touched nothing, so no commit was made
    Unchanged,
}

/// Primitive operations against one workspace and its remote
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Whether the workspace already holds a checkout
    fn is_repository(&self, workspace: &Path) -> bool;

    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        workspace: &Path,
    ) -> Result<Revision, BackendError>;

    /// Moves the workspace to the remote branch head, discarding local commits
    async fn pull(&self, workspace: &Path, branch: &str) -> Result<Revision, BackendError>;

    /// Stages `files` (relative to the workspace) and commits them
    async fn commit(
        &self,
        workspace: &Path,
        files: &[PathBuf],
        message: &str,
    ) -> Result<Revision, BackendError>;

    async fn push(&self, workspace: &Path, branch: &str) -> Result<PushOutcome, BackendError>;

    /// Current head of the remote branch without touching any workspace
    async fn remote_head(&self, url: &str, branch: &str) -> Result<Option<Revision>, BackendError>;
}

/// File mutation applied to a workspace, re-run on every push retry
///
/// Returns the workspace-relative paths it changed; an empty list means the
/// workspace already had the intended content.
pub trait FileEdit: Send + Sync {
    fn apply(&self, workspace: &Path) -> Result<Vec<PathBuf>, VcsError>;
}

impl<F> FileEdit for F
where
    F: Fn(&Path) -> Result<Vec<PathBuf>, VcsError> + Send + Sync,
{
    fn apply(&self, workspace: &Path) -> Result<Vec<PathBuf>, VcsError> {
        self(workspace)
    }
}

/// Retry bounds of the version-control client
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Attempts for a single network operation before `RemoteUnreachable`
    pub network_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Commit-and-push attempts before `ConcurrentUpdateConflict`
    pub push_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            network_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            push_attempts: 5,
        }
    }
}

/// Version-control client bound to one branch
pub struct VcsClient {
    backend: Arc<dyn GitBackend>,
    branch: String,
    retry: RetrySettings,
}

impl VcsClient {
    pub fn new(backend: Arc<dyn GitBackend>, branch: impl Into<String>) -> Self {
        Self {
            backend,
            branch: branch.into(),
            retry: RetrySettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Brings the workspace to the latest remote state (clone or pull)
    pub async fn sync(
        &self,
        repo_url: &str,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<Revision, VcsError> {
        let revision = if self.backend.is_repository(workspace) {
            debug!("Pulling {} into {}", repo_url, workspace.display());
            self.with_backoff(repo_url, cancel, || {
                self.backend.pull(workspace, &self.branch)
            })
            .await?
        } else {
            info!("Cloning {} into {}", repo_url, workspace.display());
            self.with_backoff(repo_url, cancel, || {
                self.backend.clone_repo(repo_url, &self.branch, workspace)
            })
            .await?
        };

        debug!("Workspace {} at {}", workspace.display(), revision);
        Ok(revision)
    }

    /// Applies `edit`, commits the touched files and pushes
    ///
    /// A rejected push re-bases the workspace onto the remote head and
    /// re-applies `edit` on that fresh base before trying again.
    pub async fn commit_and_push<E>(
        &self,
        remote: &str,
        workspace: &Path,
        edit: &E,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitOutcome, VcsError>
    where
        E: FileEdit + ?Sized,
    {
        for attempt in 1..=self.retry.push_attempts {
            if cancel.is_cancelled() {
                return Err(VcsError::Cancelled);
            }

            let files = edit.apply(workspace)?;
            if files.is_empty() {
                debug!("Edit produced no changes in {}", workspace.display());
                return Ok(CommitOutcome::Unchanged);
            }

            self.backend.commit(workspace, &files, message).await?;

            let pushed = self
                .with_backoff(remote, cancel, || {
                    self.backend.push(workspace, &self.branch)
                })
                .await?;

            match pushed {
                PushOutcome::Pushed(revision) => {
                    info!(
                        "Pushed {} to {} ({}) on attempt {}",
                        revision, remote, self.branch, attempt
                    );
                    return Ok(CommitOutcome::Committed {
                        revision,
                        attempts: attempt,
                    });
                }
                PushOutcome::Rejected => {
                    warn!(
                        "Push to {} rejected as non-fast-forward (attempt {}/{})",
                        remote, attempt, self.retry.push_attempts
                    );
                    if attempt == self.retry.push_attempts {
                        break;
                    }
                    self.with_backoff(remote, cancel, || {
                        self.backend.pull(workspace, &self.branch)
                    })
                    .await?;
                }
            }
        }

        Err(VcsError::ConcurrentUpdateConflict {
            remote: remote.to_string(),
            attempts: self.retry.push_attempts,
        })
    }

    /// Head of the tracked branch on the remote
    pub async fn remote_head(
        &self,
        repo_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Revision>, VcsError> {
        self.with_backoff(repo_url, cancel, || {
            self.backend.remote_head(repo_url, &self.branch)
        })
        .await
    }

    /// Runs a network operation with exponential backoff on transient failures
    async fn with_backoff<T, F, Fut>(
        &self,
        remote: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, VcsError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let mut delay = self.retry.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(VcsError::Cancelled),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(BackendError::Transient(message)) => {
                    if attempt >= self.retry.network_attempts {
                        return Err(VcsError::RemoteUnreachable {
                            remote: remote.to_string(),
                            attempts: attempt,
                            message,
                        });
                    }

                    warn!(
                        "Remote {} unreachable (attempt {}/{}): {}. Retrying in {:?}",
                        remote, attempt, self.retry.network_attempts, message, delay
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(VcsError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    delay = (delay * 2).min(self.retry.max_backoff);
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryGit;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REMOTE: &str = "mem://config";

    fn write_value(value: &'static str) -> impl Fn(&Path) -> Result<Vec<PathBuf>, VcsError> {
        move |workspace: &Path| {
            let path = PathBuf::from("value.txt");
            let file = workspace.join(&path);
            if std::fs::read_to_string(&file).ok().as_deref() == Some(value) {
                return Ok(Vec::new());
            }
            std::fs::write(&file, value)?;
            Ok(vec![path])
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            network_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            push_attempts: 5,
        }
    }

    #[tokio::test]
    async fn test_sync_clones_then_pulls() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "a")]);
        let client = VcsClient::new(git.clone(), "main");
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let first = client.sync(REMOTE, dir.path(), &cancel).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("value.txt")).unwrap(), "a");

        git.commit_on_remote(REMOTE, "value.txt", "b");
        let second = client.sync(REMOTE, dir.path(), &cancel).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(dir.path().join("value.txt")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_sync_retries_transient_failures() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "a")]);
        git.fail_next_network_calls(2);
        let client = VcsClient::new(git.clone(), "main").with_retry(fast_retry());
        let dir = tempfile::tempdir().unwrap();

        assert!(
            client
                .sync(REMOTE, dir.path(), &CancellationToken::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_sync_gives_up_after_bounded_attempts() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "a")]);
        git.fail_next_network_calls(10);
        let client = VcsClient::new(git.clone(), "main").with_retry(fast_retry());
        let dir = tempfile::tempdir().unwrap();

        let err = client
            .sync(REMOTE, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VcsError::RemoteUnreachable { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_unchanged_edit_makes_no_commit() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "a")]);
        let client = VcsClient::new(git.clone(), "main");
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        client.sync(REMOTE, dir.path(), &cancel).await.unwrap();

        let outcome = client
            .commit_and_push(REMOTE, dir.path(), &write_value("a"), "noop", &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Unchanged);
        assert_eq!(git.history(REMOTE).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_both_land() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "base")]);
        let cancel = CancellationToken::new();

        let first = VcsClient::new(git.clone(), "main");
        let second = VcsClient::new(git.clone(), "main");
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        first.sync(REMOTE, dir_a.path(), &cancel).await.unwrap();
        second.sync(REMOTE, dir_b.path(), &cancel).await.unwrap();

        let second_edits = AtomicUsize::new(0);
        let counting_edit = |workspace: &Path| {
            second_edits.fetch_add(1, Ordering::SeqCst);
            write_value("org/app:43")(workspace)
        };

        let first_edit = write_value("org/app:42");
        let (a, b) = tokio::join!(
            first.commit_and_push(REMOTE, dir_a.path(), &first_edit, "a", &cancel),
            second.commit_and_push(REMOTE, dir_b.path(), &counting_edit, "b", &cancel),
        );

        assert!(matches!(a.unwrap(), CommitOutcome::Committed { attempts: 1, .. }));
        assert!(matches!(b.unwrap(), CommitOutcome::Committed { attempts: 2, .. }));
        assert_eq!(second_edits.load(Ordering::SeqCst), 2);

        let history = git.history(REMOTE);
        let messages: Vec<_> = history.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["seed", "a", "b"]);
        assert_eq!(
            git.file_at_head(REMOTE, "value.txt").as_deref(),
            Some("org/app:43")
        );
    }

    #[tokio::test]
    async fn test_persistent_rejection_is_a_conflict() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "base")]);
        git.reject_pushes(true);
        let client = VcsClient::new(git.clone(), "main").with_retry(fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        client.sync(REMOTE, dir.path(), &cancel).await.unwrap();

        let err = client
            .commit_and_push(REMOTE, dir.path(), &write_value("x"), "x", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VcsError::ConcurrentUpdateConflict { attempts: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_final_rejection_is_a_conflict_without_rebasing() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "base")]);
        let client = VcsClient::new(git.clone(), "main").with_retry(RetrySettings {
            push_attempts: 1,
            ..fast_retry()
        });
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        client.sync(REMOTE, dir.path(), &cancel).await.unwrap();

        git.reject_pushes(true);
        git.fail_pulls(true);
        let err = client
            .commit_and_push(REMOTE, dir.path(), &write_value("x"), "x", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VcsError::ConcurrentUpdateConflict { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_push() {
        let git = Arc::new(InMemoryGit::new());
        git.seed(REMOTE, [("value.txt", "base")]);
        let client = VcsClient::new(git.clone(), "main");
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        client.sync(REMOTE, dir.path(), &cancel).await.unwrap();

        cancel.cancel();
        let err = client
            .commit_and_push(REMOTE, dir.path(), &write_value("x"), "x", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::Cancelled));
    }
}
