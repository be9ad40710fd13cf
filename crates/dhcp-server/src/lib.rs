//! Stateless DHCPv4 responder.
//!
//! Answers Discover/Request for clients whose MAC carries the managed
//! prefix, using the address bound to that MAC in the ClusterIP ledger.
//! There is no lease table; the binding store is the only state.

pub mod config;
pub mod error;
pub mod packet;
pub mod responder;
pub mod server;

pub use config::DhcpConfig;
pub use error::{DhcpError, Result};
pub use packet::{DhcpRequest, LeaseParams};
pub use responder::{AllocatorLookup, LeaseLookup, Reply, Responder};
pub use server::DhcpServer;
