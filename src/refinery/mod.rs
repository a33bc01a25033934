//! The merge-queue refinery core.
//!
//! Takes a backlog of pending merge requests, assembles them into batches,
//! stacks them as squash commits on a fresh mainline tip, runs the
//! configured verification gates, and either lands the whole batch
//! atomically or bisects it to isolate the culprits while landing the
//! known-good subset.

pub mod assemble;
pub mod bisect;
pub mod gates;
pub mod processor;
pub mod slot;
pub mod stack;
pub mod types;

pub use assemble::assemble_batch;
pub use bisect::BisectOutcome;
pub use gates::{GateError, GateRunner};
pub use processor::BatchProcessor;
pub use slot::{FileMergeSlot, MergeSlot, NoopMergeSlot, SlotError, SlotStatus};
pub use stack::{build_rebase_stack, StackOutcome};
pub use types::{BatchResult, GateOutcome, GateReport, MrInfo, ProcessError};
