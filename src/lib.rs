// Mergeyard - merge-queue refinery core
// Batches pending merge requests, stacks them onto mainline, gates the
// result, and lands the good subset. The surrounding workflow manager
// supplies the queue, the merge-slot backend, and the schedule.

pub mod config;
pub mod external;
pub mod refinery;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{BatchConfig, GateConfig, RefineryConfig};
pub use external::{
    CommandError, CommandExecutor, CommandOutput, GitAdapter, GitError, ProcessCommandExecutor,
};
pub use refinery::{
    assemble_batch, BatchProcessor, BatchResult, FileMergeSlot, GateOutcome, GateReport,
    GateRunner, MergeSlot, MrInfo, NoopMergeSlot, ProcessError, SlotStatus, StackOutcome,
};
pub use telemetry::{generate_correlation_id, init_telemetry};
