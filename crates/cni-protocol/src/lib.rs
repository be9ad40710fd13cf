//! Attach protocol between the CNI plugin and the attachment server
//!
//! One newline-terminated JSON [`CniRequest`] per connection, answered by one
//! [`CniResponse`]; the connection is then closed.

pub mod error;
pub mod framing;
pub mod kube_args;
pub mod message;
pub mod result;

pub use error::ProtocolError;
pub use framing::{MAX_MESSAGE_BYTES, read_message, write_message};
pub use kube_args::KubeArgs;
pub use message::{CmdArgs, CniRequest, CniResponse, Command};
pub use result::{CNI_VERSION, CniErrorReply, CniResult, Interface, IpConfig, SUPPORTED_VERSIONS, VersionInfo};

/// Default path of the attachment server socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/histack-ovn-cni.sock";
