//! SDN backend errors

use std::time::Duration;

use thiserror::Error;

/// Failures driving the switch, the northbound database or netlink tools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdnError {
    /// The program could not be started
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The program ran and exited non-zero
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("unexpected output from {program}: {output}")]
    UnexpectedOutput { program: String, output: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SdnError {
    /// Whether the failure reports that the target device does not exist.
    pub fn is_missing_device(&self) -> bool {
        matches!(self, SdnError::CommandFailed { stderr, .. }
            if stderr.contains("Cannot find device") || stderr.contains("does not exist"))
    }
}
