//! Per-datagram DHCP state machine.
//!
//! No lease table is kept: every Discover/Request is answered from the
//! binding that currently carries the client's MAC.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use crds::IpFamily;
use dhcproto::v4::{DhcpOption, MessageType, OptionCode};
use ipam::{Allocator, IpamError};
use tracing::{debug, info, warn};

use crate::config::DhcpConfig;
use crate::error::{DhcpError, Result};
use crate::packet::{self, DhcpRequest, LeaseParams, ReplyBuilder};

/// Server-side DHCP port; relays are answered here.
pub const SERVER_PORT: u16 = 67;
/// Client-side DHCP port.
pub const CLIENT_PORT: u16 = 68;

/// Source of lease parameters for a client MAC.
#[async_trait]
pub trait LeaseLookup: Send + Sync {
    /// `Ok(None)` when no live binding carries `mac`.
    async fn lease_for_mac(&self, mac: &str) -> Result<Option<LeaseParams>>;
}

/// [`LeaseLookup`] backed by the allocator's binding store.
pub struct AllocatorLookup {
    allocator: Arc<Allocator>,
    /// Used when the binding's pool has no gateway
    fallback_gateway: Option<Ipv4Addr>,
}

impl std::fmt::Debug for AllocatorLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorLookup")
            .field("fallback_gateway", &self.fallback_gateway)
            .finish_non_exhaustive()
    }
}

impl AllocatorLookup {
    /// `fallback_gateway` is used when the binding has no pool gateway.
    pub fn new(allocator: Arc<Allocator>, fallback_gateway: Option<Ipv4Addr>) -> Self {
        Self {
            allocator,
            fallback_gateway,
        }
    }
}

#[async_trait]
impl LeaseLookup for AllocatorLookup {
    async fn lease_for_mac(&self, mac: &str) -> Result<Option<LeaseParams>> {
        let binding = match self.allocator.find_by_mac(mac, IpFamily::V4).await {
            Ok(binding) => binding,
            Err(IpamError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(DhcpError::Lookup(e.to_string())),
        };

        let address = binding
            .spec
            .address
            .parse::<Ipv4Addr>()
            .map_err(|e| DhcpError::Lookup(format!("binding address {:?}: {e}", binding.spec.address)))?;

        let pool_gateway = match self.allocator.find_pool(&binding.spec.cluster_ip_pool).await {
            Ok(pool) => pool.spec.gateway.and_then(|gw| gw.parse::<Ipv4Addr>().ok()),
            Err(e) => {
                debug!(pool = %binding.spec.cluster_ip_pool, "Pool lookup failed: {}", e);
                None
            }
        };

        Ok(Some(LeaseParams {
            address,
            gateway: pool_gateway.or(self.fallback_gateway),
        }))
    }
}

/// An encoded reply and where to send it.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Encoded DHCP message
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
    /// OFFER, ACK or NAK
    pub message_type: MessageType,
    /// Address leased, `None` for a NAK
    pub address: Option<Ipv4Addr>,
}

/// Answers single datagrams.
pub struct Responder {
    lookup: Arc<dyn LeaseLookup>,
    config: DhcpConfig,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Where a reply to `request` received from `peer` goes.
fn destination(request: &DhcpRequest, peer: SocketAddr, message_type: &MessageType) -> SocketAddr {
    if !request.relay_ip.is_unspecified() {
        return SocketAddr::new(IpAddr::V4(request.relay_ip), SERVER_PORT);
    }
    if *message_type == MessageType::Nak || peer.ip().is_unspecified() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), CLIENT_PORT);
    }
    peer
}

impl Responder {
    /// Creates a responder answering from `lookup`.
    pub fn new(lookup: Arc<dyn LeaseLookup>, config: DhcpConfig) -> Self {
        Self { lookup, config }
    }

    fn builder(&self) -> ReplyBuilder<'_> {
        ReplyBuilder {
            server_ip: self.config.server_address,
            dns_servers: &self.config.dns_servers,
            lease_time: self.config.lease_time,
        }
    }

    /// Handles one datagram from `peer`. `None` means no reply is sent.
    pub async fn handle(&self, data: &[u8], peer: SocketAddr) -> Option<Reply> {
        let request = match DhcpRequest::parse(data) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %peer, "Dropping datagram: {}", e);
                return None;
            }
        };

        if !self.config.mac_prefix.matches(&request.mac_address) {
            return None;
        }

        debug!(
            mac = %request.mac_address,
            msg_type = ?request.message_type,
            relay = %request.relay_ip,
            "Received DHCP request"
        );

        let message = match request.message_type {
            MessageType::Discover => {
                let lease = self.lease(&request).await?;
                self.builder().lease(&request, MessageType::Offer, &lease)
            }
            MessageType::Request => {
                if !self.addressed_to_us(&request) {
                    debug!(mac = %request.mac_address, "Request selects another server");
                    return None;
                }
                let lease = self.lease(&request).await?;
                match request.claimed_address() {
                    Some(claimed) if claimed == lease.address => {
                        self.builder().lease(&request, MessageType::Ack, &lease)
                    }
                    claimed => {
                        info!(
                            mac = %request.mac_address,
                            requested = ?claimed,
                            bound = %lease.address,
                            "Requested address does not match binding"
                        );
                        self.builder().nak(&request, "requested address is not bound to this client")
                    }
                }
            }
            other => {
                debug!(mac = %request.mac_address, "Ignoring {:?}", other);
                return None;
            }
        };

        let message_type = match message.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(mt)) => mt.clone(),
            _ => return None,
        };
        let bytes = match packet::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(mac = %request.mac_address, "{}", e);
                return None;
            }
        };
        let address = (!message.yiaddr().is_unspecified()).then_some(message.yiaddr());

        Some(Reply {
            destination: destination(&request, peer, &message_type),
            bytes,
            message_type,
            address,
        })
    }

    /// Option 54 absent or naming this server.
    fn addressed_to_us(&self, request: &DhcpRequest) -> bool {
        match request.message.opts().get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(id)) => *id == self.config.server_address,
            _ => true,
        }
    }

    /// Bound lease for the client, or `None` (logged) when there is nothing
    /// to answer with.
    async fn lease(&self, request: &DhcpRequest) -> Option<LeaseParams> {
        let lookup = self.lookup.lease_for_mac(&request.mac_address);
        match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(Ok(Some(lease))) => Some(lease),
            Ok(Ok(None)) => {
                debug!(mac = %request.mac_address, "No binding for MAC");
                None
            }
            Ok(Err(e)) => {
                warn!(mac = %request.mac_address, "{}", e);
                None
            }
            Err(_) => {
                warn!(mac = %request.mac_address, "Binding lookup timed out after {:?}", self.config.lookup_timeout);
                None
            }
        }
    }
}
