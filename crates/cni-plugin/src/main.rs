//! Histack CNI plugin
//!
//! Invoked by the container runtime per the CNI contract. `ADD` and `DEL`
//! are forwarded to the node-local attachment server; `CHECK` succeeds
//! without doing anything and `VERSION` reports the supported versions.
//! Results and errors are printed to stdout as CNI JSON; logs go to stderr.

mod client;
mod env;

use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use cni_protocol::{CniErrorReply, CniRequest, Command, SUPPORTED_VERSIONS, VersionInfo};
use env::{CniEnv, Invocation, NetConf};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// A failure together with the CNI error code reported for it.
#[derive(Debug)]
struct Failure {
    code: u32,
    error: anyhow::Error,
}

impl Failure {
    fn new(code: u32, error: anyhow::Error) -> Self {
        Self { code, error }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let (output, code) = match run().await {
        Ok(Some(output)) => (Some(output), ExitCode::SUCCESS),
        Ok(None) => (None, ExitCode::SUCCESS),
        Err(failure) => {
            error!("{:#}", failure.error);
            let reply = CniErrorReply::new(failure.code, failure.error.to_string(), format!("{:#}", failure.error));
            (serde_json::to_string(&reply).ok(), ExitCode::FAILURE)
        }
    };

    if let Some(output) = output {
        let mut stdout = std::io::stdout().lock();
        if writeln!(stdout, "{output}").is_err() {
            return ExitCode::FAILURE;
        }
    }
    code
}

async fn run() -> Result<Option<String>, Failure> {
    let cni = CniEnv::from_lookup(|key| std::env::var(key).ok())
        .map_err(|e| Failure::new(CniErrorReply::INVALID_ENVIRONMENT, e))?;

    if cni.command == Invocation::Version {
        let info = serde_json::to_string(&VersionInfo::default())
            .map_err(|e| Failure::new(CniErrorReply::PLUGIN_ERROR, e.into()))?;
        return Ok(Some(info));
    }

    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("reading network configuration")
        .map_err(|e| Failure::new(CniErrorReply::INVALID_CONFIG, e))?;
    let conf = NetConf::parse(&raw).map_err(|e| Failure::new(CniErrorReply::INVALID_CONFIG, e))?;
    debug!(network = %conf.name, command = ?cni.command, "Invoked");

    let command = match cni.command {
        Invocation::Add => Command::Add,
        Invocation::Del => Command::Del,
        Invocation::Check | Invocation::Version => return Ok(None),
    };

    let response = client::send(Path::new(&conf.socket_path), &CniRequest::new(command, cni.args))
        .await
        .map_err(|e| {
            let code = if e.is::<client::Unreachable>() {
                CniErrorReply::TRY_AGAIN_LATER
            } else {
                CniErrorReply::PLUGIN_ERROR
            };
            Failure::new(code, e)
        })?;

    if response.is_error() {
        return Err(Failure::new(CniErrorReply::PLUGIN_ERROR, anyhow::anyhow!(response.error)));
    }

    match response.result {
        Some(mut result) if command == Command::Add => {
            if SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
                result.cni_version = conf.cni_version;
            }
            let output = serde_json::to_string(&result).map_err(|e| Failure::new(CniErrorReply::PLUGIN_ERROR, e.into()))?;
            Ok(Some(output))
        }
        _ => Ok(None),
    }
}
