//! Node-local attachment server.
//!
//! The CNI plugin binary forwards ADD/DEL requests over a Unix socket; this
//! crate allocates the workload address through [`ipam`] and wires the
//! interface into the OVS bridge and OVN logical switch through [`sdn`].

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod server;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use error::AttachError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, port_id};
pub use server::{CniServer, bind, handle_connection};
