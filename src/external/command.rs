//! Base command execution abstraction
//!
//! Provides the foundational trait for running subprocesses, enabling
//! dependency injection for testing. Every invocation is rooted in an
//! explicit working directory and honors a cancellation token.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Captured stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("command not found: {command}")]
    CommandNotFound { command: String },
    #[error("command cancelled: {command}")]
    Cancelled { command: String },
    #[error("io error: {message}")]
    Io { message: String },
}

/// Trait for executing external commands
///
/// This abstraction allows the rest of the crate to spawn subprocesses
/// without directly depending on `tokio::process::Command`, enabling
/// testing with mock implementations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Real implementation using tokio's process support.
///
/// Children are spawned with `kill_on_drop` so cancellation terminates
/// any in-flight subprocess instead of orphaning it.
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = tokio::process::Command::new(program);
        command.args(args).current_dir(cwd).kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CommandError::Cancelled {
                    command: program.to_string(),
                });
            }
            result = command.output() => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CommandError::CommandNotFound {
                        command: program.to_string(),
                    }
                } else {
                    CommandError::Io {
                        message: e.to_string(),
                    }
                }
            })?,
        };

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
