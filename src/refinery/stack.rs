//! Rebase stacking: replay a batch of MR branches as squash commits on a
//! fresh mainline tip.
//!
//! A conflicting MR is dropped and recorded; it never aborts the batch and
//! never changes what later MRs see, because each probe runs against the
//! tip as it stands after the MRs that actually stacked.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::external::{GitAdapter, GitError};
use crate::refinery::types::MrInfo;

/// Result of one stacking pass.
#[derive(Debug, Default)]
pub struct StackOutcome {
    /// MRs whose squash commits are on the work branch, in input order.
    pub stacked: Vec<MrInfo>,
    /// MRs dropped because they could not integrate.
    pub conflicts: Vec<MrInfo>,
    /// Mainline tip the stack was built on.
    pub base: String,
    /// Head of the work branch: base when nothing stacked.
    pub tip: String,
}

/// Name of the scratch branch the stack is assembled on.
pub fn work_branch(target: &str) -> String {
    format!("mergeyard/batch-{}", target.replace('/', "-"))
}

/// Stack `batch` onto a freshly fetched `target` tip.
///
/// Fetch failure is a hard error; individual MRs failing to integrate are
/// soft and reported in the outcome. On return the work branch is checked
/// out with its tree identical to what the gates will see.
pub async fn build_rebase_stack(
    git: &GitAdapter,
    batch: &[MrInfo],
    target: &str,
    cancel: &CancellationToken,
) -> Result<StackOutcome, GitError> {
    let mut outcome = StackOutcome::default();

    git.fetch_mainline(target, cancel).await?;
    let base = git.remote_tip(target, cancel).await?;

    let branch = work_branch(target);
    git.create_or_reset_branch(&branch, &base, cancel).await?;

    outcome.tip = base.clone();
    outcome.base = base;

    for mr in batch {
        if !git.branch_exists(&mr.branch, cancel).await? {
            debug!(mr = %mr.id, branch = %mr.branch, "branch missing, marking conflict");
            outcome.conflicts.push(mr.clone());
            continue;
        }

        if !git.can_stack(&mr.branch, &outcome.tip, cancel).await? {
            debug!(mr = %mr.id, branch = %mr.branch, "conflicts with stack tip");
            outcome.conflicts.push(mr.clone());
            continue;
        }

        let message = merge_message(git, mr, cancel).await;
        match git.stack_onto(&mr.branch, &message, cancel).await {
            Ok(tip) => {
                info!(mr = %mr.id, tip = %tip, "stacked");
                outcome.tip = tip;
                outcome.stacked.push(mr.clone());
            }
            // The probe and the real merge can disagree on exotic trees;
            // treat a late conflict the same as a probed one.
            Err(GitError::MergeConflict { .. }) => {
                outcome.conflicts.push(mr.clone());
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcome)
}

/// Commit message for an MR's squash commit: the head commit message of
/// its branch, or a synthesized fallback when the branch cannot be read.
pub async fn merge_message(git: &GitAdapter, mr: &MrInfo, cancel: &CancellationToken) -> String {
    match git.read_head_message(&mr.branch, cancel).await {
        Ok(message) if !message.is_empty() => message,
        _ => match &mr.source_issue {
            Some(issue) => format!("Squash merge {} (from {})", mr.id, issue),
            None => format!("Squash merge {}", mr.id),
        },
    }
}
