//! Git command abstractions
//!
//! A narrow, subprocess-backed git surface for batch integration: branch
//! probing, squash stacking, fast-forward publish. Operations that mutate
//! the working tree abort any in-progress merge on failure so the tree is
//! always left recoverable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};

pub type BranchName = String;
pub type CommitSha = String;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("branch not found: {branch}")]
    BranchNotFound { branch: BranchName },
    #[error("merge conflict while stacking {branch}")]
    MergeConflict { branch: BranchName },
    #[error("push rejected (non-fast-forward) for {target}")]
    NonFastForward { target: BranchName },
    #[error("command execution error: {source}")]
    Command {
        #[from]
        source: CommandError,
    },
    #[error("git command failed: {message}")]
    CommandFailed { message: String },
}

impl GitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            GitError::Command {
                source: CommandError::Cancelled { .. }
            }
        )
    }
}

/// Subprocess git driver rooted in a working clone of the target.
///
/// The remote is assumed to be `origin`. All operations honor the caller's
/// cancellation token; an in-flight git process is killed on cancel.
pub struct GitAdapter {
    executor: Arc<dyn CommandExecutor>,
    workdir: PathBuf,
}

impl GitAdapter {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self::with_executor(workdir, Arc::new(ProcessCommandExecutor))
    }

    pub fn with_executor<P: AsRef<Path>>(workdir: P, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn raw(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, GitError> {
        debug!(args = ?args, "running git");
        Ok(self.executor.execute("git", args, &self.workdir, cancel).await?)
    }

    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<String, GitError> {
        let output = self.raw(args, cancel).await?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Move HEAD to an existing branch.
    pub async fn checkout(&self, branch: &str, cancel: &CancellationToken) -> Result<(), GitError> {
        self.run(&["checkout", branch], cancel).await?;
        Ok(())
    }

    /// Create `name` at `base`, hard-resetting it if it already exists.
    pub async fn create_or_reset_branch(
        &self,
        name: &str,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.run(&["checkout", "-B", name, base], cancel).await?;
        Ok(())
    }

    /// Update the local tracking ref of the remote target to its current tip.
    pub async fn fetch_mainline(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.run(&["fetch", "origin", target], cancel).await?;
        Ok(())
    }

    /// Resolve the fetched tip of `origin/<target>`.
    pub async fn remote_tip(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitSha, GitError> {
        self.rev_parse(&format!("origin/{target}"), cancel).await
    }

    pub async fn rev_parse(
        &self,
        rev: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitSha, GitError> {
        self.run(&["rev-parse", rev], cancel).await
    }

    pub async fn branch_exists(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GitError> {
        let output = self
            .raw(
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
                cancel,
            )
            .await?;
        Ok(output.success())
    }

    /// Probe whether `branch` integrates onto `onto_tip` without conflict.
    ///
    /// Uses an in-memory tree merge; the working tree is never touched.
    pub async fn can_stack(
        &self,
        branch: &str,
        onto_tip: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GitError> {
        let output = self
            .raw(&["merge-tree", "--write-tree", onto_tip, branch], cancel)
            .await?;
        match output.status_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(GitError::CommandFailed {
                message: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Apply `branch` atop HEAD as a single squash commit with `message`.
    ///
    /// Returns the new tip. On conflict the staged merge is discarded before
    /// the error is returned, leaving the tree clean at the previous tip.
    pub async fn stack_onto(
        &self,
        branch: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitSha, GitError> {
        let merge = self.raw(&["merge", "--squash", branch], cancel).await?;
        if !merge.success() {
            self.abort_in_progress(cancel).await;
            return Err(GitError::MergeConflict {
                branch: branch.to_string(),
            });
        }

        // A branch already contained in the tip squashes to an empty diff;
        // --allow-empty keeps the one-commit-per-MR invariant.
        let commit = self
            .raw(&["commit", "--allow-empty", "-m", message], cancel)
            .await?;
        if !commit.success() {
            self.abort_in_progress(cancel).await;
            return Err(GitError::CommandFailed {
                message: commit.stderr.trim().to_string(),
            });
        }

        self.rev_parse("HEAD", cancel).await
    }

    /// Make the local `target` branch equal `tip` (fast-forward only).
    pub async fn fast_forward_target(
        &self,
        target: &str,
        tip: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.checkout(target, cancel).await?;
        self.run(&["merge", "--ff-only", tip], cancel).await?;
        Ok(())
    }

    /// Publish local `target` to origin, returning the pushed tip.
    pub async fn push(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<CommitSha, GitError> {
        let output = self.raw(&["push", "origin", target], cancel).await?;
        if !output.success() {
            let stderr = output.stderr;
            if stderr.contains("non-fast-forward")
                || stderr.contains("fetch first")
                || stderr.contains("[rejected]")
            {
                return Err(GitError::NonFastForward {
                    target: target.to_string(),
                });
            }
            return Err(GitError::CommandFailed {
                message: stderr.trim().to_string(),
            });
        }
        self.rev_parse(target, cancel).await
    }

    /// Return the top commit's full message for `branch`.
    pub async fn read_head_message(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GitError> {
        let output = self.raw(&["log", "-1", "--format=%B", branch], cancel).await?;
        if !output.success() {
            return Err(GitError::BranchNotFound {
                branch: branch.to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Best-effort recovery: abort any in-progress merge and drop staged
    /// changes so the next operation starts from a clean tree.
    pub async fn abort_in_progress(&self, cancel: &CancellationToken) {
        let _ = self.raw(&["merge", "--abort"], cancel).await;
        let _ = self.raw(&["reset", "--hard", "HEAD"], cancel).await;
    }
}
