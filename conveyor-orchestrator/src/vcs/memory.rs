//! In-memory git backend for tests
//!
//! Remotes are linear lists of snapshots; workspaces are real directories
//! so file edits behave exactly as they would against a checkout.

use super::{BackendError, GitBackend, PushOutcome, Revision};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct Commit {
    pub revision: Revision,
    pub message: String,
    pub files: Snapshot,
}

#[derive(Debug)]
struct Checkout {
    url: String,
    base: Revision,
    pending: Vec<Commit>,
}

#[derive(Default)]
struct State {
    remotes: HashMap<String, Vec<Commit>>,
    checkouts: HashMap<PathBuf, Checkout>,
    next_revision: u64,
    failing_calls: u32,
    failing_pulls: bool,
    reject_pushes: bool,
}

impl State {
    fn revision(&mut self) -> Revision {
        self.next_revision += 1;
        format!("{:07x}", self.next_revision)
    }

    fn network_call(&mut self) -> Result<(), BackendError> {
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(BackendError::Transient(
                "Could not resolve host: config.invalid".to_string(),
            ));
        }
        Ok(())
    }

    fn head(&self, url: &str) -> Result<&Commit, BackendError> {
        self.remotes
            .get(url)
            .and_then(|history| history.last())
            .ok_or_else(|| BackendError::Fatal(format!("repository {} not found", url)))
    }
}

#[derive(Default)]
pub struct InMemoryGit {
    state: Mutex<State>,
}

impl InMemoryGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a remote with a single "seed" commit
    pub fn seed<'a>(&self, url: &str, files: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut state = self.state.lock().unwrap();
        let revision = state.revision();
        let files = files
            .into_iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        state.remotes.insert(
            url.to_string(),
            vec![Commit {
                revision,
                message: "seed".to_string(),
                files,
            }],
        );
    }

    /// Simulates another writer pushing directly to the remote
    pub fn commit_on_remote(&self, url: &str, path: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        let mut files = state.head(url).unwrap().files.clone();
        files.insert(path.to_string(), content.to_string());
        let revision = state.revision();
        state.remotes.get_mut(url).unwrap().push(Commit {
            revision,
            message: "external".to_string(),
            files,
        });
    }

    pub fn fail_next_network_calls(&self, count: u32) {
        self.state.lock().unwrap().failing_calls = count;
    }

    /// Makes every pull fail as a transient network error
    pub fn fail_pulls(&self, fail: bool) {
        self.state.lock().unwrap().failing_pulls = fail;
    }

    pub fn reject_pushes(&self, reject: bool) {
        self.state.lock().unwrap().reject_pushes = reject;
    }

    pub fn history(&self, url: &str) -> Vec<Commit> {
        self.state
            .lock()
            .unwrap()
            .remotes
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn file_at_head(&self, url: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.head(url).ok()?.files.get(path).cloned()
    }
}

fn checkout_files(workspace: &Path, files: &Snapshot) -> Result<(), BackendError> {
    std::fs::create_dir_all(workspace)?;
    for (path, content) in files {
        let target = workspace.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}

#[async_trait]
impl GitBackend for InMemoryGit {
    fn is_repository(&self, workspace: &Path) -> bool {
        self.state.lock().unwrap().checkouts.contains_key(workspace)
    }

    async fn clone_repo(
        &self,
        url: &str,
        _branch: &str,
        workspace: &Path,
    ) -> Result<Revision, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.network_call()?;

        let head = state.head(url)?.clone();
        checkout_files(workspace, &head.files)?;
        state.checkouts.insert(
            workspace.to_path_buf(),
            Checkout {
                url: url.to_string(),
                base: head.revision.clone(),
                pending: Vec::new(),
            },
        );
        Ok(head.revision)
    }

    async fn pull(&self, workspace: &Path, _branch: &str) -> Result<Revision, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.network_call()?;
        if state.failing_pulls {
            return Err(BackendError::Transient("Connection reset by peer".to_string()));
        }

        let url = state
            .checkouts
            .get(workspace)
            .map(|c| c.url.clone())
            .ok_or_else(|| BackendError::Fatal("not a repository".to_string()))?;
        let head = state.head(&url)?.clone();
        checkout_files(workspace, &head.files)?;

        if let Some(checkout) = state.checkouts.get_mut(workspace) {
            checkout.base = head.revision.clone();
            checkout.pending.clear();
        }
        Ok(head.revision)
    }

    async fn commit(
        &self,
        workspace: &Path,
        files: &[PathBuf],
        message: &str,
    ) -> Result<Revision, BackendError> {
        let mut state = self.state.lock().unwrap();
        let revision = state.revision();

        let checkout = state
            .checkouts
            .get(workspace)
            .ok_or_else(|| BackendError::Fatal("not a repository".to_string()))?;
        let mut snapshot = match checkout.pending.last() {
            Some(commit) => commit.files.clone(),
            None => state.head(&checkout.url)?.files.clone(),
        };

        for file in files {
            let content = std::fs::read_to_string(workspace.join(file))?;
            snapshot.insert(file.to_string_lossy().into_owned(), content);
        }

        if let Some(checkout) = state.checkouts.get_mut(workspace) {
            checkout.pending.push(Commit {
                revision: revision.clone(),
                message: message.to_string(),
                files: snapshot,
            });
        }
        Ok(revision)
    }

    async fn push(&self, workspace: &Path, _branch: &str) -> Result<PushOutcome, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.network_call()?;

        let (url, base, pending) = match state.checkouts.get(workspace) {
            Some(c) => (c.url.clone(), c.base.clone(), c.pending.clone()),
            None => return Err(BackendError::Fatal("not a repository".to_string())),
        };

        if state.reject_pushes || state.head(&url)?.revision != base {
            return Ok(PushOutcome::Rejected);
        }

        let Some(last) = pending.last().map(|c| c.revision.clone()) else {
            return Ok(PushOutcome::Pushed(base));
        };

        if let Some(history) = state.remotes.get_mut(&url) {
            history.extend(pending);
        }
        if let Some(checkout) = state.checkouts.get_mut(workspace) {
            checkout.base = last.clone();
            checkout.pending.clear();
        }
        Ok(PushOutcome::Pushed(last))
    }

    async fn remote_head(&self, url: &str, _branch: &str) -> Result<Option<Revision>, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.network_call()?;
        Ok(state
            .remotes
            .get(url)
            .and_then(|history| history.last())
            .map(|c| c.revision.clone()))
    }
}
