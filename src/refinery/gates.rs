//! Gate execution against the stacked working tree.
//!
//! Each gate is a shell command; non-zero exit is failure. Serial mode
//! short-circuits on the first failure. Parallel mode starts every gate
//! and waits for all of them so diagnostics are complete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GateConfig;
use crate::external::{CommandError, CommandExecutor};
use crate::refinery::types::{GateOutcome, GateReport};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate execution cancelled")]
    Cancelled,
    #[error("gate task failed: {message}")]
    Internal { message: String },
}

pub struct GateRunner {
    executor: Arc<dyn CommandExecutor>,
    workdir: PathBuf,
}

impl GateRunner {
    pub fn new<P: AsRef<Path>>(workdir: P, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    /// Run the configured gates. Zero gates is an automatic pass.
    pub async fn run(
        &self,
        gates: &BTreeMap<String, GateConfig>,
        parallel: bool,
        cancel: &CancellationToken,
    ) -> Result<GateReport, GateError> {
        if gates.is_empty() {
            return Ok(GateReport::default());
        }
        if parallel {
            self.run_parallel(gates, cancel).await
        } else {
            self.run_serial(gates, cancel).await
        }
    }

    async fn run_serial(
        &self,
        gates: &BTreeMap<String, GateConfig>,
        cancel: &CancellationToken,
    ) -> Result<GateReport, GateError> {
        let mut report = GateReport::default();
        for (name, gate) in gates {
            let outcome = run_gate(
                Arc::clone(&self.executor),
                self.workdir.clone(),
                name.clone(),
                gate.clone(),
                cancel.clone(),
            )
            .await?;
            let passed = outcome.passed;
            report.outcomes.push(outcome);
            if !passed {
                break;
            }
        }
        Ok(report)
    }

    async fn run_parallel(
        &self,
        gates: &BTreeMap<String, GateConfig>,
        cancel: &CancellationToken,
    ) -> Result<GateReport, GateError> {
        let mut handles = Vec::with_capacity(gates.len());
        for (name, gate) in gates {
            handles.push(tokio::spawn(run_gate(
                Arc::clone(&self.executor),
                self.workdir.clone(),
                name.clone(),
                gate.clone(),
                cancel.clone(),
            )));
        }

        // Wait for every gate; siblings of a failed gate keep running so
        // their output lands in the report.
        let mut report = GateReport::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => report.outcomes.push(outcome),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(GateError::Internal {
                        message: e.to_string(),
                    });
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        report.outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(report)
    }
}

async fn run_gate(
    executor: Arc<dyn CommandExecutor>,
    workdir: PathBuf,
    name: String,
    gate: GateConfig,
    cancel: CancellationToken,
) -> Result<GateOutcome, GateError> {
    debug!(gate = %name, cmd = %gate.cmd, "running gate");
    let args = ["-c", gate.cmd.as_str()];
    let execution = executor.execute("sh", &args, &workdir, &cancel);

    let result = match gate.timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => {
                return Ok(GateOutcome {
                    name,
                    passed: false,
                    output: format!("gate timed out after {limit:?}"),
                })
            }
        },
        None => execution.await,
    };

    match result {
        Ok(output) => Ok(GateOutcome {
            name,
            passed: output.success(),
            output: output.combined(),
        }),
        Err(CommandError::Cancelled { .. }) => Err(GateError::Cancelled),
        // An unspawnable gate is a gate failure, not an infrastructure error.
        Err(e) => Ok(GateOutcome {
            name,
            passed: false,
            output: e.to_string(),
        }),
    }
}
