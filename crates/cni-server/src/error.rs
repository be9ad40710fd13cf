//! Attachment errors

use std::time::Duration;

use cni_protocol::ProtocolError;
use ipam::IpamError;
use sdn::SdnError;
use thiserror::Error;

/// Errors returned to attach/detach callers.
///
/// `DevicePair`, `SwitchPort` and `LogicalPort` are partial failures: an
/// earlier step succeeded before the named step failed.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Allocation or release failed
    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("creating device pair for {port_id}: {source}")]
    DevicePair { port_id: String, source: SdnError },

    #[error("attaching switch port for {port_id}: {source}")]
    SwitchPort { port_id: String, source: SdnError },

    #[error("creating logical port {port_id}: {source}")]
    LogicalPort { port_id: String, source: SdnError },

    /// One or more detach steps failed; the rest still ran
    #[error("detaching {port_id}: {failures}")]
    Detach { port_id: String, failures: String },

    /// The request was not completed within the deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Every connection slot is taken
    #[error("server busy, try again later")]
    Busy,

    /// `cmd` names neither an attach nor a detach
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
