//! Recording SDN doubles for unit testing
//!
//! Every call is appended to a shared [`Journal`] so tests can assert the
//! order of side effects across the switch, the logical network and the
//! device provisioner. Individual call kinds can be told to fail.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::command::CommandRunner;
use crate::control::{DevicePair, DevicePairRequest, DeviceProvisioner, Link, LogicalNetworkControl, SwitchControl};
use crate::error::SdnError;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted [`CommandRunner`] that records command lines instead of running them.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    invocations: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `stdout` for command lines containing `needle`.
    pub fn respond_matching(&self, needle: &str, stdout: &str) {
        locked(&self.responses).push((needle.to_string(), stdout.to_string()));
    }

    /// Fails command lines containing `needle` with `stderr`.
    pub fn fail_matching(&self, needle: &str, stderr: &str) {
        locked(&self.failures).push((needle.to_string(), stderr.to_string()));
    }

    /// Command lines run so far.
    pub fn invocations(&self) -> Vec<String> {
        locked(&self.invocations).clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, SdnError> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        locked(&self.invocations).push(line.clone());

        if let Some((_, stderr)) = locked(&self.failures).iter().find(|(n, _)| line.contains(n.as_str())) {
            return Err(SdnError::CommandFailed {
                program: program.to_string(),
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            });
        }
        Ok(locked(&self.responses)
            .iter()
            .find(|(n, _)| line.contains(n.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

/// Kind of a recorded SDN call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    AddPort,
    DelPort,
    CreateLogicalPort,
    DeleteLogicalPort,
    CreateDevicePair,
    DeleteDevice,
}

/// A recorded SDN call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdnCall {
    AddPort {
        bridge: String,
        port: String,
        port_type: String,
        iface_id: String,
    },
    DelPort {
        bridge: String,
        port: String,
    },
    CreateLogicalPort {
        network: String,
        port_id: String,
        mac: String,
    },
    DeleteLogicalPort {
        network: String,
        port_id: String,
    },
    CreateDevicePair(DevicePairRequest),
    DeleteDevice {
        name: String,
    },
}

impl SdnCall {
    pub fn kind(&self) -> CallKind {
        match self {
            SdnCall::AddPort { .. } => CallKind::AddPort,
            SdnCall::DelPort { .. } => CallKind::DelPort,
            SdnCall::CreateLogicalPort { .. } => CallKind::CreateLogicalPort,
            SdnCall::DeleteLogicalPort { .. } => CallKind::DeleteLogicalPort,
            SdnCall::CreateDevicePair(_) => CallKind::CreateDevicePair,
            SdnCall::DeleteDevice { .. } => CallKind::DeleteDevice,
        }
    }
}

/// Shared call log and failure switchboard.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<SdnCall>>>,
    failing: Arc<Mutex<HashSet<CallKind>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `kind` fail (it is still recorded).
    pub fn fail(&self, kind: CallKind) {
        locked(&self.failing).insert(kind);
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<SdnCall> {
        locked(&self.calls).clone()
    }

    /// Recorded calls of `kind`.
    pub fn calls_of(&self, kind: CallKind) -> Vec<SdnCall> {
        self.calls().into_iter().filter(|c| c.kind() == kind).collect()
    }

    fn record(&self, call: SdnCall) -> Result<(), SdnError> {
        let kind = call.kind();
        locked(&self.calls).push(call);
        if locked(&self.failing).contains(&kind) {
            return Err(SdnError::CommandFailed {
                program: format!("{kind:?}"),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Recording [`SwitchControl`].
#[derive(Debug, Clone, Default)]
pub struct RecordingSwitch {
    journal: Journal,
}

impl RecordingSwitch {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl SwitchControl for RecordingSwitch {
    async fn add_port(&self, bridge: &str, port: &str, port_type: &str, iface_id: &str) -> Result<(), SdnError> {
        self.journal.record(SdnCall::AddPort {
            bridge: bridge.to_string(),
            port: port.to_string(),
            port_type: port_type.to_string(),
            iface_id: iface_id.to_string(),
        })
    }

    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SdnError> {
        self.journal.record(SdnCall::DelPort {
            bridge: bridge.to_string(),
            port: port.to_string(),
        })
    }
}

/// Recording [`LogicalNetworkControl`].
#[derive(Debug, Clone, Default)]
pub struct RecordingLogicalNetwork {
    journal: Journal,
}

impl RecordingLogicalNetwork {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl LogicalNetworkControl for RecordingLogicalNetwork {
    async fn create_logical_port(&self, network: &str, port_id: &str, mac: &str) -> Result<(), SdnError> {
        self.journal.record(SdnCall::CreateLogicalPort {
            network: network.to_string(),
            port_id: port_id.to_string(),
            mac: mac.to_string(),
        })
    }

    async fn delete_logical_port(&self, network: &str, port_id: &str) -> Result<(), SdnError> {
        self.journal.record(SdnCall::DeleteLogicalPort {
            network: network.to_string(),
            port_id: port_id.to_string(),
        })
    }
}

/// Recording [`DeviceProvisioner`]. Created pairs echo the requested MAC.
#[derive(Debug, Clone, Default)]
pub struct RecordingProvisioner {
    journal: Journal,
}

impl RecordingProvisioner {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl DeviceProvisioner for RecordingProvisioner {
    async fn create_device_pair(&self, request: &DevicePairRequest) -> Result<DevicePair, SdnError> {
        self.journal.record(SdnCall::CreateDevicePair(request.clone()))?;
        Ok(DevicePair {
            host: Link {
                name: request.host_name.clone(),
                mac: "6e:00:00:00:00:01".to_string(),
                sandbox: None,
            },
            workload: Link {
                name: request.interface.clone(),
                mac: request.mac.clone(),
                sandbox: Some(request.netns.clone()),
            },
        })
    }

    async fn delete_device(&self, name: &str) -> Result<(), SdnError> {
        self.journal.record(SdnCall::DeleteDevice { name: name.to_string() })
    }
}
