//! Git operations as batched subprocesses.
//!
//! All git access goes through [`GitOps`]: explicit per-class timeouts
//! (short for queries, moderate for writes, long for worktree-heavy
//! operations), scrubbed child environments, and serialized mutations.
//! Git refuses concurrent mutations on a shared object store via its own
//! lock file; the internal mutex keeps us from ever hitting it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::invoker::scrubbed_env;

/// Timeout for read-only queries (status, rev-parse, diff).
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for ordinary writes (add, commit, reset, merge).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for repository-heavy operations (worktree add/remove).
pub const HEAVY_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from git subprocess execution.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The subprocess could not be spawned or awaited.
    #[error("git {command} failed to run: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess exceeded its timeout.
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The subprocess exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Result of merging a worktree branch back into the main tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge completed; hash of the resulting commit.
    Merged { hash: String },
    /// Merge hit conflicts and was aborted.
    Conflict { details: String },
}

/// A worktree created for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Batched git subprocess runner rooted at one repository.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
    /// Serialises mutating operations; merges in particular must land one
    /// at a time.
    write_lock: Arc<Mutex<()>>,
}

impl GitOps {
    /// Create a runner for `repo_path` without checking it is a repo yet;
    /// [`Self::is_git_repo`] answers that cheaply.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run one git command with a timeout, from `cwd` (defaults to the
    /// repo root). Environments are scrubbed of secrets.
    async fn run_in(
        &self,
        cwd: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, GitError> {
        let command_desc = args.join(" ");
        debug!(command = %command_desc, cwd = %cwd.display(), "running git");

        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env_clear()
            .envs(scrubbed_env())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GitError::Spawn {
                command: command_desc.clone(),
                source,
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command_desc.clone(),
                timeout,
            })?
            .map_err(|source| GitError::Spawn {
                command: command_desc.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: command_desc,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<std::process::Output, GitError> {
        self.run_in(&self.repo_path, args, timeout).await
    }

    async fn run_stdout(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let output = self.run(args, timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the root is a git repository.
    pub async fn is_git_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"], QUERY_TIMEOUT).await.is_ok()
    }

    /// Current HEAD commit hash.
    pub async fn head_hash(&self) -> Result<String, GitError> {
        self.run_stdout(&["rev-parse", "HEAD"], QUERY_TIMEOUT).await
    }

    /// Whether the working tree has no staged or unstaged changes.
    pub async fn is_clean(&self) -> Result<bool, GitError> {
        let status = self.run_stdout(&["status", "--porcelain"], QUERY_TIMEOUT).await?;
        Ok(status.is_empty())
    }

    /// Files changed since `since` (a commit hash), relative paths.
    pub async fn changed_files(&self, since: &str) -> Result<Vec<String>, GitError> {
        let output = self
            .run_stdout(&["diff", "--name-only", since, "HEAD"], QUERY_TIMEOUT)
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Stage everything and commit. Returns the new commit hash, or `None`
    /// when there was nothing to commit.
    pub async fn auto_commit(&self, message: &str) -> Result<Option<String>, GitError> {
        let _guard = self.write_lock.lock().await;

        self.run(&["add", "-A"], WRITE_TIMEOUT).await?;

        let status = self.run_stdout(&["status", "--porcelain"], QUERY_TIMEOUT).await?;
        if status.is_empty() {
            debug!("auto-commit: nothing to commit");
            return Ok(None);
        }

        self.run(&["commit", "-m", message], WRITE_TIMEOUT).await?;
        let hash = self.run_stdout(&["rev-parse", "HEAD"], QUERY_TIMEOUT).await?;
        info!(hash = %hash, message, "auto-committed");
        Ok(Some(hash))
    }

    /// Hard-reset the working tree to `hash`.
    pub async fn reset_hard(&self, hash: &str) -> Result<(), GitError> {
        let _guard = self.write_lock.lock().await;
        self.run(&["reset", "--hard", hash], WRITE_TIMEOUT).await?;
        info!(hash, "reset working tree");
        Ok(())
    }

    /// Branch name for a task worktree.
    pub fn worktree_branch(task_id: &str) -> String {
        format!("maestro/{task_id}")
    }

    /// Create an isolated worktree for a task under `base_dir`.
    pub async fn add_worktree(
        &self,
        base_dir: &Path,
        task_id: &str,
    ) -> Result<WorktreeHandle, GitError> {
        let _guard = self.write_lock.lock().await;

        let branch = Self::worktree_branch(task_id);
        let path = base_dir.join(task_id);
        let path_str = path.to_string_lossy().into_owned();

        self.run(
            &["worktree", "add", "-b", &branch, &path_str, "HEAD"],
            HEAVY_TIMEOUT,
        )
        .await?;

        info!(task_id, path = %path.display(), "created worktree");
        Ok(WorktreeHandle { path, branch })
    }

    /// Remove a worktree and its branch. Failures are logged as warnings
    /// and returned; stale worktrees are an operator cleanup concern, not
    /// a workflow-stopping one.
    pub async fn remove_worktree(&self, handle: &WorktreeHandle) -> Result<(), GitError> {
        let _guard = self.write_lock.lock().await;

        let path_str = handle.path.to_string_lossy().into_owned();
        if let Err(e) = self
            .run(&["worktree", "remove", "--force", &path_str], HEAVY_TIMEOUT)
            .await
        {
            warn!(path = %handle.path.display(), error = %e, "failed to remove worktree");
            return Err(e);
        }
        if let Err(e) = self
            .run(&["branch", "-D", &handle.branch], WRITE_TIMEOUT)
            .await
        {
            warn!(branch = %handle.branch, error = %e, "failed to delete worktree branch");
        }
        Ok(())
    }

    /// Commit all work inside a worktree. Returns `false` when the tree
    /// was clean.
    pub async fn commit_worktree(
        &self,
        handle: &WorktreeHandle,
        message: &str,
    ) -> Result<bool, GitError> {
        self.run_in(&handle.path, &["add", "-A"], WRITE_TIMEOUT).await?;
        let status = self
            .run_in(&handle.path, &["status", "--porcelain"], QUERY_TIMEOUT)
            .await?;
        if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
            return Ok(false);
        }
        self.run_in(&handle.path, &["commit", "-m", message], WRITE_TIMEOUT)
            .await?;
        Ok(true)
    }

    /// Merge a worktree branch into the current branch of the main tree.
    ///
    /// Merges are serialized through the write lock. On conflict the merge
    /// is aborted and reported as [`MergeOutcome::Conflict`]; the caller
    /// decides whether to retry the task or escalate.
    pub async fn merge_branch(
        &self,
        branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitError> {
        let _guard = self.write_lock.lock().await;

        match self
            .run(&["merge", "--no-ff", "-m", message, branch], WRITE_TIMEOUT)
            .await
        {
            Ok(_) => {
                let hash = self.run_stdout(&["rev-parse", "HEAD"], QUERY_TIMEOUT).await?;
                Ok(MergeOutcome::Merged { hash })
            }
            Err(GitError::Exit { stderr, .. }) => {
                warn!(branch, stderr = %stderr, "merge conflict, aborting merge");
                if let Err(e) = self.run(&["merge", "--abort"], WRITE_TIMEOUT).await {
                    warn!(error = %e, "merge --abort failed after conflict");
                }
                Ok(MergeOutcome::Conflict { details: stderr })
            }
            Err(other) => Err(other),
        }
    }

    /// Ensure commits in this repository have an identity, for
    /// environments without a global git config.
    pub async fn ensure_identity(&self) -> Result<(), GitError> {
        let has_email = self
            .run(&["config", "user.email"], QUERY_TIMEOUT)
            .await
            .is_ok();
        if !has_email {
            self.run(&["config", "user.email", "maestro@localhost"], WRITE_TIMEOUT)
                .await?;
            self.run(&["config", "user.name", "maestro"], WRITE_TIMEOUT)
                .await?;
        }
        Ok(())
    }
}
