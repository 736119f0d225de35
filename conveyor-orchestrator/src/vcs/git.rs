//! Git backend that shells out to the `git` binary

use super::{BackendError, GitBackend, PushOutcome, Revision};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

/// stderr fragments that indicate a network-level failure
const TRANSIENT_MARKERS: &[&str] = &[
    "Could not resolve host",
    "unable to access",
    "Connection refused",
    "Connection reset",
    "timed out",
    "Could not read from remote repository",
    "early EOF",
];

/// stderr fragments of a push refused because the remote moved
const REJECTED_MARKERS: &[&str] = &["[rejected]", "non-fast-forward", "fetch first"];

pub struct GitCli {
    author_name: String,
    author_email: String,
}

impl GitCli {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, BackendError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!("git {}", args.join(" "));
        let output = command.output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("git {} stderr: {}", args[0], stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "git {} failed: exit_code={}, stderr='{}'",
                args[0],
                exit_code,
                stderr.trim()
            );
            return Err(classify(&stderr, message));
        }

        Ok(stdout.trim().to_string())
    }

    async fn head(&self, workspace: &Path) -> Result<Revision, BackendError> {
        self.run(Some(workspace), &["rev-parse", "HEAD"]).await
    }
}

fn classify(stderr: &str, message: String) -> BackendError {
    if TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        BackendError::Transient(message)
    } else {
        BackendError::Fatal(message)
    }
}

fn is_rejected_push(stderr: &str) -> bool {
    REJECTED_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// First revision column of `git ls-remote` output
fn parse_ls_remote(output: &str) -> Option<Revision> {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

#[async_trait]
impl GitBackend for GitCli {
    fn is_repository(&self, workspace: &Path) -> bool {
        workspace.join(".git").exists()
    }

    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        workspace: &Path,
    ) -> Result<Revision, BackendError> {
        if let Some(parent) = workspace.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let target = workspace.to_string_lossy();
        self.run(
            None,
            &[
                "clone",
                "--branch",
                branch,
                "--single-branch",
                url,
                target.as_ref(),
            ],
        )
        .await?;

        self.head(workspace).await
    }

    async fn pull(&self, workspace: &Path, branch: &str) -> Result<Revision, BackendError> {
        self.run(Some(workspace), &["fetch", "origin", branch]).await?;

        let remote_ref = format!("origin/{}", branch);
        self.run(Some(workspace), &["reset", "--hard", &remote_ref])
            .await?;

        self.head(workspace).await
    }

    async fn commit(
        &self,
        workspace: &Path,
        files: &[PathBuf],
        message: &str,
    ) -> Result<Revision, BackendError> {
        let paths: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.run(Some(workspace), &add).await?;

        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        self.run(
            Some(workspace),
            &["-c", &name, "-c", &email, "commit", "-m", message],
        )
        .await?;

        self.head(workspace).await
    }

    async fn push(&self, workspace: &Path, branch: &str) -> Result<PushOutcome, BackendError> {
        let refspec = format!("HEAD:refs/heads/{}", branch);

        match self
            .run(Some(workspace), &["push", "origin", &refspec])
            .await
        {
            Ok(_) => Ok(PushOutcome::Pushed(self.head(workspace).await?)),
            Err(BackendError::Fatal(message)) if is_rejected_push(&message) => {
                Ok(PushOutcome::Rejected)
            }
            Err(err) => {
                error!("Push to {} failed: {}", branch, err);
                Err(err)
            }
        }
    }

    async fn remote_head(&self, url: &str, branch: &str) -> Result<Option<Revision>, BackendError> {
        let head_ref = format!("refs/heads/{}", branch);
        let output = self.run(None, &["ls-remote", url, &head_ref]).await?;
        Ok(parse_ls_remote(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_failures_as_transient() {
        let stderr = "fatal: unable to access 'https://git.example.com/config.git/': Could not resolve host: git.example.com";
        assert!(matches!(
            classify(stderr, String::new()),
            BackendError::Transient(_)
        ));

        let stderr = "fatal: pathspec 'missing.yaml' did not match any files";
        assert!(matches!(
            classify(stderr, String::new()),
            BackendError::Fatal(_)
        ));
    }

    #[test]
    fn test_detects_rejected_push() {
        let stderr = " ! [rejected]        HEAD -> main (fetch first)\nerror: failed to push some refs";
        assert!(is_rejected_push(stderr));
        assert!(!is_rejected_push("fatal: Authentication failed"));
    }

    #[test]
    fn test_parse_ls_remote() {
        let output = "3f2a9c1d0b7e6a5f4c3b2a19087f6e5d4c3b2a10\trefs/heads/main";
        assert_eq!(
            parse_ls_remote(output).as_deref(),
            Some("3f2a9c1d0b7e6a5f4c3b2a19087f6e5d4c3b2a10")
        );
        assert_eq!(parse_ls_remote(""), None);
    }
}
