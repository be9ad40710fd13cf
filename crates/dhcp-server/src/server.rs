//! UDP receive loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::error::{DhcpError, Result};
use crate::responder::Responder;

/// Largest datagram read; DHCP messages fit a standard MTU.
const MAX_DATAGRAM: usize = 1500;

/// DHCP server: one task per datagram, bounded by `max_in_flight`.
pub struct DhcpServer {
    responder: Arc<Responder>,
    listen: SocketAddr,
    max_in_flight: usize,
}

impl std::fmt::Debug for DhcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpServer")
            .field("listen", &self.listen)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

impl DhcpServer {
    /// At most `max_in_flight` datagrams are answered concurrently.
    pub fn new(responder: Arc<Responder>, listen: SocketAddr, max_in_flight: usize) -> Self {
        Self {
            responder,
            listen,
            max_in_flight: max_in_flight.max(1),
        }
    }

    async fn bind(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(self.listen)
            .await
            .map_err(|source| DhcpError::Bind {
                addr: self.listen,
                source,
            })?;
        socket.set_broadcast(true).map_err(|source| DhcpError::Bind {
            addr: self.listen,
            source,
        })?;
        Ok(socket)
    }

    /// Runs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = Arc::new(self.bind().await?);
        info!(addr = %socket.local_addr()?, "DHCP server started");
        self.serve(socket, &mut shutdown).await;
        info!("DHCP server shutting down");
        Ok(())
    }

    async fn serve(&self, socket: Arc<UdpSocket>, shutdown: &mut watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!(error = %e, "Error receiving packet");
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() || shutdown.has_changed().is_err() {
                        break;
                    }
                    continue;
                }
            };

            // Datagrams beyond the in-flight limit are dropped; clients retransmit.
            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                debug!(peer = %peer, "Handler limit reached, dropping datagram");
                continue;
            };

            let data = buf[..len].to_vec();
            let responder = Arc::clone(&self.responder);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(reply) = responder.handle(&data, peer).await {
                    match socket.send_to(&reply.bytes, reply.destination).await {
                        Ok(_) => info!(
                            msg_type = ?reply.message_type,
                            address = ?reply.address,
                            dest = %reply.destination,
                            "Sent DHCP response"
                        ),
                        Err(e) => warn!(dest = %reply.destination, "Failed to send DHCP response: {}", e),
                    }
                }
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhcpConfig;
    use crate::packet::LeaseParams;
    use crate::packet::tests::client_message;
    use crate::responder::LeaseLookup;
    use async_trait::async_trait;
    use dhcproto::v4::{Message, MessageType};
    use dhcproto::{Decodable, Encodable};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct OneLease;

    #[async_trait]
    impl LeaseLookup for OneLease {
        async fn lease_for_mac(&self, mac: &str) -> Result<Option<LeaseParams>> {
            Ok((mac == "02:00:00:00:00:01").then_some(LeaseParams {
                address: Ipv4Addr::new(10, 0, 0, 7),
                gateway: None,
            }))
        }
    }

    #[tokio::test]
    async fn answers_over_udp_until_shutdown() {
        let listen = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let responder = Arc::new(Responder::new(
            Arc::new(OneLease),
            DhcpConfig {
                server_address: Ipv4Addr::LOCALHOST,
                ..DhcpConfig::default()
            },
        ));
        let server = DhcpServer::new(responder, listen, 4);
        let socket = Arc::new(server.bind().await.unwrap());
        let server_addr = socket.local_addr().unwrap();

        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move { server.serve(socket, &mut rx).await });

        let client = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let discover = client_message(MessageType::Discover, [0x02, 0, 0, 0, 0, 1]);
        client.send_to(&discover.to_vec().unwrap(), server_addr).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let offer = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(offer.yiaddr(), Ipv4Addr::new(10, 0, 0, 7));

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
