//! DHCPv4 packet parsing and reply construction.

use std::net::Ipv4Addr;

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use ipnet::Ipv4Net;

use crate::error::{DhcpError, Result};

/// Fields of a client message the responder acts on.
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    /// Original message
    pub message: Message,
    /// Option 53
    pub message_type: MessageType,
    /// Client hardware address, lowercase colon separated
    pub mac_address: String,
    /// Option 50
    pub requested_ip: Option<Ipv4Addr>,
    /// `ciaddr`, set by clients renewing a lease
    pub client_ip: Ipv4Addr,
    /// `giaddr`, set when the request came through a relay
    pub relay_ip: Ipv4Addr,
}

impl DhcpRequest {
    /// Decodes a BOOTREQUEST datagram. Anything else is rejected.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message = Message::from_bytes(data).map_err(|e| DhcpError::Parse(e.to_string()))?;
        if message.opcode() != Opcode::BootRequest {
            return Err(DhcpError::Parse("not a BOOTREQUEST".to_string()));
        }

        let message_type = match message.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(mt)) => mt.clone(),
            _ => return Err(DhcpError::Parse("missing message type".to_string())),
        };

        let chaddr = message.chaddr();
        if chaddr.len() < 6 {
            return Err(DhcpError::Parse(format!("hardware address too short ({} bytes)", chaddr.len())));
        }
        let mac_address = chaddr[..6]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        let requested_ip = match message.opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };

        Ok(Self {
            client_ip: message.ciaddr(),
            relay_ip: message.giaddr(),
            message,
            message_type,
            mac_address,
            requested_ip,
        })
    }

    /// Address the client asks to confirm: option 50, else `ciaddr`.
    pub fn claimed_address(&self) -> Option<Ipv4Addr> {
        self.requested_ip
            .or_else(|| (!self.client_ip.is_unspecified()).then_some(self.client_ip))
    }
}

/// Network parameters handed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseParams {
    /// Address placed in `yiaddr`
    pub address: Ipv4Addr,
    /// Router option and classless routes; omitted when unknown
    pub gateway: Option<Ipv4Addr>,
}

/// Builds OFFER/ACK/NAK replies.
#[derive(Debug, Clone)]
pub struct ReplyBuilder<'a> {
    /// Server identifier, option 54
    pub server_ip: Ipv4Addr,
    pub dns_servers: &'a [Ipv4Addr],
    /// Lease time in seconds
    pub lease_time: u32,
}

/// Host route to the gateway, then the default route through it.
///
/// Clients get a /32 mask, so the gateway is only reachable through the
/// explicit on-link route.
pub fn static_routes(gateway: Ipv4Addr) -> Vec<(Ipv4Net, Ipv4Addr)> {
    vec![
        (Ipv4Net::from(gateway), Ipv4Addr::UNSPECIFIED),
        (Ipv4Net::default(), gateway),
    ]
}

impl ReplyBuilder<'_> {
    fn base(&self, request: &DhcpRequest, message_type: MessageType) -> Message {
        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_xid(request.message.xid());
        reply.set_flags(request.message.flags());
        reply.set_chaddr(request.message.chaddr());
        reply.set_giaddr(request.relay_ip);
        reply.opts_mut().insert(DhcpOption::MessageType(message_type));
        reply.opts_mut().insert(DhcpOption::ServerIdentifier(self.server_ip));
        reply
    }

    /// OFFER or ACK for `lease`.
    pub fn lease(&self, request: &DhcpRequest, message_type: MessageType, lease: &LeaseParams) -> Message {
        let is_ack = message_type == MessageType::Ack;
        let mut reply = self.base(request, message_type);
        reply.set_yiaddr(lease.address);
        reply.set_siaddr(self.server_ip);
        if is_ack {
            reply.set_ciaddr(request.client_ip);
        }

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::SubnetMask(Ipv4Addr::BROADCAST));
        if let Some(gateway) = lease.gateway {
            opts.insert(DhcpOption::ClasslessStaticRoute(static_routes(gateway)));
        }
        if !self.dns_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(self.dns_servers.to_vec()));
        }
        opts.insert(DhcpOption::AddressLeaseTime(self.lease_time));
        reply
    }

    /// NAK carrying `reason` as option 56.
    pub fn nak(&self, request: &DhcpRequest, reason: &str) -> Message {
        let mut reply = self.base(request, MessageType::Nak);
        reply.opts_mut().insert(DhcpOption::Message(reason.to_string()));
        reply
    }
}

/// Serializes a reply for the wire.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.to_vec().map_err(|e| DhcpError::Encode(e.to_string()))
}
