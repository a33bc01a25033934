//! Prefix bisection of a gate-failing stack.
//!
//! Each half of a failing segment is independently re-stacked on a fresh
//! mainline tip and gated. Passing halves are wholly good; failing halves
//! split again, down to singletons. A failure that only reproduces with
//! both halves combined therefore attributes no culprit at all, and the
//! caller treats the batch as flaky.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RefineryConfig;
use crate::external::GitAdapter;
use crate::refinery::gates::GateRunner;
use crate::refinery::stack::build_rebase_stack;
use crate::refinery::types::{MrInfo, ProcessError};

/// Everything a bisection run needs from the processor.
pub(crate) struct BisectCtx<'a> {
    pub git: &'a GitAdapter,
    pub gates: &'a GateRunner,
    pub config: &'a RefineryConfig,
    pub target: &'a str,
}

#[derive(Debug, Default)]
pub struct BisectOutcome {
    /// MRs that passed gates in some attempt, input order preserved.
    pub good: Vec<MrInfo>,
    /// MRs that fail gates in isolation, input order preserved.
    pub culprits: Vec<MrInfo>,
    /// MRs dropped by stacking conflicts during attempts, de-duplicated.
    pub conflicts: Vec<MrInfo>,
}

struct HalfAttempt {
    stacked: Vec<MrInfo>,
    conflicts: Vec<MrInfo>,
    passed: bool,
}

/// Isolate the culprits in a stack that failed gates as a whole.
///
/// Every MR of `batch` ends up in exactly one of good, culprits, or
/// conflicts.
pub(crate) async fn bisect_batch(
    ctx: &BisectCtx<'_>,
    batch: &[MrInfo],
    cancel: &CancellationToken,
) -> Result<BisectOutcome, ProcessError> {
    info!(size = batch.len(), target = ctx.target, "bisecting failing batch");
    let mut outcome = bisect_failed(ctx, batch.to_vec(), cancel).await?;
    dedup_by_id(&mut outcome.conflicts);
    Ok(outcome)
}

type BisectFuture<'a> = Pin<Box<dyn Future<Output = Result<BisectOutcome, ProcessError>> + Send + 'a>>;

/// Recursive step over a segment known to have failed as a unit.
fn bisect_failed<'a>(
    ctx: &'a BisectCtx<'a>,
    segment: Vec<MrInfo>,
    cancel: &'a CancellationToken,
) -> BisectFuture<'a> {
    Box::pin(async move {
        let mut outcome = BisectOutcome::default();

        if segment.len() <= 1 {
            outcome.culprits = segment;
            return Ok(outcome);
        }

        let mid = segment.len() / 2;
        let (first, second) = segment.split_at(mid);

        for half in [first, second] {
            let attempt = attempt_half(ctx, half, cancel).await?;
            outcome.conflicts.extend(attempt.conflicts);

            if attempt.stacked.is_empty() {
                continue;
            }
            if attempt.passed {
                debug!(ids = ?ids(&attempt.stacked), "half passed gates");
                outcome.good.extend(attempt.stacked);
            } else {
                debug!(ids = ?ids(&attempt.stacked), "half failed gates, splitting");
                let sub = bisect_failed(ctx, attempt.stacked, cancel).await?;
                outcome.good.extend(sub.good);
                outcome.culprits.extend(sub.culprits);
                outcome.conflicts.extend(sub.conflicts);
            }
        }

        Ok(outcome)
    })
}

/// Stack one half on a fresh mainline tip and run the gates over it.
async fn attempt_half(
    ctx: &BisectCtx<'_>,
    half: &[MrInfo],
    cancel: &CancellationToken,
) -> Result<HalfAttempt, ProcessError> {
    let stack = build_rebase_stack(ctx.git, half, ctx.target, cancel)
        .await
        .map_err(ProcessError::from_git)?;

    if stack.stacked.is_empty() {
        return Ok(HalfAttempt {
            stacked: Vec::new(),
            conflicts: stack.conflicts,
            passed: false,
        });
    }

    let report = ctx
        .gates
        .run(&ctx.config.gates, ctx.config.gates_parallel, cancel)
        .await?;

    Ok(HalfAttempt {
        stacked: stack.stacked,
        conflicts: stack.conflicts,
        passed: report.passed(),
    })
}

fn dedup_by_id(mrs: &mut Vec<MrInfo>) {
    let mut seen = HashSet::new();
    mrs.retain(|mr| seen.insert(mr.id.clone()));
}

fn ids(mrs: &[MrInfo]) -> Vec<&str> {
    mrs.iter().map(|mr| mr.id.as_str()).collect()
}
