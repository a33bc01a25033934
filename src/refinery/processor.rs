//! Batch orchestration: slot -> assemble -> stack -> gate -> land.
//!
//! The processor is single-threaded per invocation; the only internal
//! concurrency is parallel gate execution. All soft failures are recorded
//! in the returned [`BatchResult`]; the merge slot is released on every
//! exit path.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{BatchConfig, RefineryConfig};
use crate::external::{CommandExecutor, GitAdapter, GitError, ProcessCommandExecutor};
use crate::refinery::assemble::assemble_batch;
use crate::refinery::bisect::{bisect_batch, BisectCtx};
use crate::refinery::gates::{GateError, GateRunner};
use crate::refinery::stack::{self, StackOutcome};
use crate::refinery::slot::{MergeSlot, NoopMergeSlot};
use crate::refinery::types::{BatchResult, GateReport, MrInfo, ProcessError};
use crate::telemetry::generate_correlation_id;

/// Integrates batches of merge requests into a target branch.
///
/// Owns the git driver, the gate runner, and a handle to the merge slot.
/// One instance serves one working clone; invocations against the same
/// target are serialized by the slot.
pub struct BatchProcessor {
    git: GitAdapter,
    gates: GateRunner,
    config: RefineryConfig,
    slot: Arc<dyn MergeSlot>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl BatchProcessor {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self::with_executor(workdir, Arc::new(ProcessCommandExecutor))
    }

    pub fn with_executor<P: AsRef<Path>>(workdir: P, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            git: GitAdapter::with_executor(workdir.as_ref(), Arc::clone(&executor)),
            gates: GateRunner::new(workdir.as_ref(), executor),
            config: RefineryConfig::default(),
            slot: Arc::new(NoopMergeSlot),
            output: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    pub fn with_config(mut self, config: RefineryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_slot(mut self, slot: Arc<dyn MergeSlot>) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Mutex::new(output);
        self
    }

    pub fn config_mut(&mut self) -> &mut RefineryConfig {
        &mut self.config
    }

    /// Process one batch end to end.
    ///
    /// Total: every failure mode is reported through [`BatchResult`],
    /// never a panic. The merge slot spans assemble through publish and is
    /// released before returning, success or failure.
    pub async fn process_batch(
        &self,
        mrs: &[MrInfo],
        target: &str,
        cfg: Option<&BatchConfig>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let correlation_id = generate_correlation_id();
        let span = info_span!("process_batch", target, correlation_id = %correlation_id);
        self.process_batch_inner(mrs, target, cfg, cancel)
            .instrument(span)
            .await
    }

    async fn process_batch_inner(
        &self,
        mrs: &[MrInfo],
        target: &str,
        cfg: Option<&BatchConfig>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let batch = assemble_batch(mrs, cfg);
        if batch.is_empty() {
            self.say("nothing to merge: empty batch");
            return BatchResult::default();
        }
        self.say(&format!(
            "processing batch of {} MR(s) onto {target}",
            batch.len()
        ));

        if let Err(e) = self.slot.ensure_exists().await {
            return BatchResult::failed(e.into());
        }
        let holder = self.config.name.clone();
        let status = match self.slot.acquire(&holder, true).await {
            Ok(status) => status,
            Err(e) => return BatchResult::failed(e.into()),
        };
        if !status.available {
            self.say(&format!(
                "merge slot busy (held by {}), backing off",
                status.holder
            ));
            return BatchResult::failed(ProcessError::SlotBusy {
                holder: status.holder,
            });
        }

        let result = self.process_locked(&batch, target, cfg, cancel).await;

        if let Err(e) = self.slot.release(&holder).await {
            warn!(error = %e, "failed to release merge slot");
        }
        result
    }

    async fn process_locked(
        &self,
        batch: &[MrInfo],
        target: &str,
        cfg: Option<&BatchConfig>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        if batch.len() == 1 {
            return self.merge_single(&batch[0], target, cancel).await;
        }

        let mut result = BatchResult::default();

        let stack = match self.build_rebase_stack(batch, target, cancel).await {
            Ok(stack) => stack,
            Err(e) => {
                result.error = Some(ProcessError::from_git(e));
                return result;
            }
        };
        result.conflicts = stack.conflicts;
        for mr in &result.conflicts {
            self.say(&format!("conflict: {} ({}) dropped from batch", mr.id, mr.branch));
        }

        if stack.stacked.is_empty() {
            self.say("no MRs could be stacked; nothing to merge");
            return result;
        }

        let mut report = match self.run_gates(cancel).await {
            Ok(report) => report,
            Err(e) => {
                result.error = Some(e.into());
                return result;
            }
        };

        let retry_on_flaky = cfg.map_or(true, |c| c.retry_batch_on_flaky);
        if !report.passed() && retry_on_flaky {
            self.say("gates failed; retrying once for flakiness");
            report = match self.run_gates(cancel).await {
                Ok(report) => report,
                Err(e) => {
                    result.error = Some(e.into());
                    return result;
                }
            };
        }

        if report.passed() {
            match self.publish(target, &stack.tip, cancel).await {
                Ok(sha) => {
                    self.say(&format!("merged {} MR(s) as {sha}", stack.stacked.len()));
                    result.merged = stack.stacked;
                    result.merge_commit = sha;
                }
                Err(e) => result.error = Some(ProcessError::from_git(e)),
            }
            return result;
        }

        self.dump_gate_failures(&report);
        self.say("gates still failing; bisecting to isolate culprits");
        let ctx = BisectCtx {
            git: &self.git,
            gates: &self.gates,
            config: &self.config,
            target,
        };
        let bisect = match bisect_batch(&ctx, &stack.stacked, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };

        result.culprits = bisect.culprits;
        for mr in &result.culprits {
            self.say(&format!("culprit: {} breaks the gates", mr.id));
        }
        merge_conflicts(&mut result.conflicts, bisect.conflicts);

        if bisect.good.is_empty() {
            if result.culprits.is_empty() {
                self.say("bisection found no culprit; batch looks flaky, nothing merged");
            }
            return result;
        }

        // The good set is a subsequence of the already-stacked set, so it
        // stacks clean against itself on the same mainline tip.
        let restack = match self.build_rebase_stack(&bisect.good, target, cancel).await {
            Ok(stack) => stack,
            Err(e) => {
                result.error = Some(ProcessError::from_git(e));
                return result;
            }
        };
        merge_conflicts(&mut result.conflicts, restack.conflicts);
        if restack.stacked.is_empty() {
            return result;
        }
        match self.publish(target, &restack.tip, cancel).await {
            Ok(sha) => {
                self.say(&format!(
                    "merged {} good MR(s) as {sha} after bisection",
                    restack.stacked.len()
                ));
                result.merged = restack.stacked;
                result.merge_commit = sha;
            }
            Err(e) => result.error = Some(ProcessError::from_git(e)),
        }
        result
    }

    /// Fast path for a batch of one: stack, gate, land. No retry, no
    /// bisection; a gate failure makes the MR the culprit.
    async fn merge_single(
        &self,
        mr: &MrInfo,
        target: &str,
        cancel: &CancellationToken,
    ) -> BatchResult {
        self.say(&format!("single MR: {} ({})", mr.id, mr.branch));
        let mut result = BatchResult::default();

        let stack = match self
            .build_rebase_stack(std::slice::from_ref(mr), target, cancel)
            .await
        {
            Ok(stack) => stack,
            Err(e) => {
                result.error = Some(ProcessError::from_git(e));
                return result;
            }
        };
        result.conflicts = stack.conflicts;
        if stack.stacked.is_empty() {
            return result;
        }

        let report = match self.run_gates(cancel).await {
            Ok(report) => report,
            Err(e) => {
                result.error = Some(e.into());
                return result;
            }
        };

        if report.passed() {
            match self.publish(target, &stack.tip, cancel).await {
                Ok(sha) => {
                    result.merged = stack.stacked;
                    result.merge_commit = sha;
                }
                Err(e) => result.error = Some(ProcessError::from_git(e)),
            }
        } else {
            self.dump_gate_failures(&report);
            result.culprits = stack.stacked;
        }
        result
    }

    /// Stack `batch` onto a fresh `target` tip, reporting per-MR conflicts.
    pub async fn build_rebase_stack(
        &self,
        batch: &[MrInfo],
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<StackOutcome, GitError> {
        stack::build_rebase_stack(&self.git, batch, target, cancel).await
    }

    /// Commit message an MR will land with.
    pub async fn merge_message(&self, mr: &MrInfo, cancel: &CancellationToken) -> String {
        stack::merge_message(&self.git, mr, cancel).await
    }

    async fn run_gates(&self, cancel: &CancellationToken) -> Result<GateReport, GateError> {
        let report = self
            .gates
            .run(&self.config.gates, self.config.gates_parallel, cancel)
            .await?;
        for outcome in &report.outcomes {
            self.say(&format!(
                "gate {}: {}",
                outcome.name,
                if outcome.passed { "pass" } else { "FAIL" }
            ));
        }
        Ok(report)
    }

    async fn publish(
        &self,
        target: &str,
        tip: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GitError> {
        self.git.fast_forward_target(target, tip, cancel).await?;
        let sha = self.git.push(target, cancel).await?;
        info!(target, sha = %sha, "published");
        Ok(sha)
    }

    fn dump_gate_failures(&self, report: &GateReport) {
        for outcome in report.failures() {
            self.say(&format!("gate {} output:\n{}", outcome.name, outcome.output));
        }
    }

    fn say(&self, msg: &str) {
        if let Ok(mut out) = self.output.lock() {
            let _ = writeln!(out, "{msg}");
        }
    }
}

fn merge_conflicts(into: &mut Vec<MrInfo>, more: Vec<MrInfo>) {
    into.extend(more);
    let mut seen = HashSet::new();
    into.retain(|mr| seen.insert(mr.id.clone()));
}
