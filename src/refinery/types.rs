use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external::GitError;
use crate::refinery::gates::GateError;
use crate::refinery::slot::SlotError;

/// A pending merge request, supplied by the external queue.
///
/// Immutable for the duration of a batch; the caller owns the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrInfo {
    /// Opaque id, unique within a batch.
    pub id: String,
    /// Source branch in the local repo.
    pub branch: String,
    /// Destination branch, typically `main`.
    pub target: String,
    /// Id of an MR that must precede this one in the same batch.
    #[serde(default)]
    pub blocked_by: Option<String>,
    /// External work-item reference, used only for fallback commit messages.
    #[serde(default)]
    pub source_issue: Option<String>,
    /// Queue admission time, for stable ordering ties.
    pub created_at: DateTime<Utc>,
}

impl MrInfo {
    pub fn new<S: Into<String>>(id: S, branch: S, target: S) -> Self {
        Self {
            id: id.into(),
            branch: branch.into(),
            target: target.into(),
            blocked_by: None,
            source_issue: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal failure of a batch run.
///
/// Soft outcomes (conflicts, culprits) are data on [`BatchResult`], not
/// errors; this enum covers the cases where the batch as a whole could not
/// make progress.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("merge slot busy (held by {holder})")]
    SlotBusy { holder: String },
    #[error("merge slot error: {0}")]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Git(GitError),
    #[error("gate runner error: {0}")]
    Gate(GateError),
    #[error("batch processing cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn from_git(e: GitError) -> Self {
        if e.is_cancelled() {
            ProcessError::Cancelled
        } else {
            ProcessError::Git(e)
        }
    }
}

impl From<GitError> for ProcessError {
    fn from(e: GitError) -> Self {
        ProcessError::from_git(e)
    }
}

impl From<GateError> for ProcessError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Cancelled => ProcessError::Cancelled,
            other => ProcessError::Gate(other),
        }
    }
}

/// Outcome of one `process_batch` invocation. Owned by the caller.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// MRs that landed on the remote target, in input order.
    pub merged: Vec<MrInfo>,
    /// MRs dropped because their changes clash with the current tip.
    pub conflicts: Vec<MrInfo>,
    /// MRs identified by bisection as gate-breakers.
    pub culprits: Vec<MrInfo>,
    /// SHA of the final remote-visible commit; empty if nothing merged.
    pub merge_commit: String,
    /// Terminal failure, if any. Partial progress already pushed remains.
    pub error: Option<ProcessError>,
}

impl BatchResult {
    pub fn failed(error: ProcessError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Result of one gate command run.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub name: String,
    pub passed: bool,
    /// Captured stdout+stderr, for diagnostics.
    pub output: String,
}

/// Aggregate result of running the configured gate set.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub outcomes: Vec<GateOutcome>,
}

impl GateReport {
    /// Pass iff every executed gate passed. Zero gates is a pass.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}
