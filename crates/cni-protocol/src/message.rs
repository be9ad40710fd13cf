//! Request and response envelopes.

use serde::{Deserialize, Serialize};

use crate::result::CniResult;

/// Attach command carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
}

impl Command {
    /// Wire name used between plugin and server.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Add => "Add",
            Command::Del => "Del",
        }
    }

    /// Parses a command name; CNI_COMMAND spellings are accepted too.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Add" | "ADD" => Some(Command::Add),
            "Del" | "DEL" => Some(Command::Del),
            _ => None,
        }
    }
}

/// Arguments of an attach request, mirroring the CNI plugin invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdArgs {
    /// Container runtime ID of the workload sandbox
    #[serde(alias = "containerId", default)]
    pub workload_id: String,

    /// Network namespace path
    #[serde(default)]
    pub netns: String,

    /// Interface to create inside the workload
    pub if_name: String,

    /// `;`-separated `KEY=VALUE` pairs (see [`crate::KubeArgs`])
    #[serde(default)]
    pub args: String,

    /// Plugin search path
    #[serde(default)]
    pub path: String,
}

/// One attach request.
///
/// `cmd` stays a string so an unknown command decodes and can be answered
/// with an error instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniRequest {
    /// Command name, see [`Command::as_str`]
    pub cmd: String,
    pub cmd_args: CmdArgs,
}

impl CniRequest {
    /// Request for `command` with the given arguments.
    pub fn new(command: Command, cmd_args: CmdArgs) -> Self {
        Self {
            cmd: command.as_str().to_string(),
            cmd_args,
        }
    }

    /// Known command, if any.
    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.cmd)
    }
}

/// Reply to one attach request. `error` is empty on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CniResult>,

    #[serde(default)]
    pub error: String,
}

impl CniResponse {
    /// Successful reply, with a result for ADD.
    pub fn success(result: Option<CniResult>) -> Self {
        Self {
            result,
            error: String::new(),
        }
    }

    /// Reply carrying only an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: error.into(),
        }
    }

    /// Whether the reply reports a failure.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
