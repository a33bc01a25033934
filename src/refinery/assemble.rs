use crate::config::BatchConfig;
use crate::refinery::types::MrInfo;

/// Select an ordered prefix of the pending queue for one batch.
///
/// Pure: no git, no I/O. Walks the queue in order, admitting MRs until the
/// size cap is reached. An MR blocked by another is admitted only if its
/// blocker is already in the batch; otherwise it is skipped and later MRs
/// are still considered. `None` config means unbounded with no blocking
/// checks.
pub fn assemble_batch(mrs: &[MrInfo], cfg: Option<&BatchConfig>) -> Vec<MrInfo> {
    let mut batch: Vec<MrInfo> = Vec::new();

    for mr in mrs {
        if let Some(cfg) = cfg {
            if batch.len() >= cfg.max_batch_size {
                break;
            }
            if let Some(blocker) = &mr.blocked_by {
                if !batch.iter().any(|admitted| &admitted.id == blocker) {
                    continue;
                }
            }
        }
        batch.push(mr.clone());
    }

    batch
}
