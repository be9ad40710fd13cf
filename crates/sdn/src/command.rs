//! External command execution with a deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::SdnError;

/// Default deadline for a single command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and returns its stdout.
    async fn run(&self, program: &str, args: &[String]) -> Result<String, SdnError>;
}

/// [`CommandRunner`] spawning real processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    /// Every command is killed after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, SdnError> {
        debug!("Running {} {}", program, args.join(" "));

        let child = Command::new(program).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| SdnError::Timeout {
                program: program.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| SdnError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SdnError::CommandFailed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Builds an owned argument vector.
pub(crate) fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}
