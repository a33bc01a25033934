use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Upper bound on MRs stacked into a single batch.
    pub max_batch_size: usize,
    /// How long the caller should coalesce the queue before invoking the
    /// core. Carried for callers; the core itself never sleeps on it.
    pub batch_wait_time: Duration,
    /// Retry the whole batch's gates once before bisecting.
    pub retry_batch_on_flaky: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            batch_wait_time: Duration::from_secs(30),
            retry_batch_on_flaky: true,
        }
    }
}

/// A single verification gate: a shell command run against the stacked
/// working tree. Non-zero exit is failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub cmd: String,
    /// Per-gate wall clock limit. None (the default) means no limit;
    /// cancellation still propagates from the caller.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl GateConfig {
    pub fn new<S: Into<String>>(cmd: S) -> Self {
        Self {
            cmd: cmd.into(),
            timeout: None,
        }
    }
}

/// Processor-wide settings: the gate set and how to run it, plus the name
/// this processor uses when claiming the merge slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineryConfig {
    /// Gate name -> gate. BTreeMap so serial execution order is
    /// deterministic.
    #[serde(default)]
    pub gates: BTreeMap<String, GateConfig>,
    /// Run gates concurrently instead of serially.
    #[serde(default)]
    pub gates_parallel: bool,
    /// Merge-slot holder name for this processor.
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "mergeyard".to_string()
}

impl Default for RefineryConfig {
    fn default() -> Self {
        Self {
            gates: BTreeMap::new(),
            gates_parallel: false,
            name: default_name(),
        }
    }
}
