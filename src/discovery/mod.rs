//! Broadcast peer discovery
//!
//! The monitor broadcasts a 4-byte `PING` on the well-known discovery port;
//! a live streamer answers `PONG` to the sender's address. The exchange is
//! datagram-based and unreliable: the session's connection timer is the only
//! retry/timeout guard, there is no retransmission here.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::DiscoveryError;

/// Discovery request marker
pub const PING: &[u8; 4] = b"PING";

/// Discovery reply marker
pub const PONG: &[u8; 4] = b"PONG";

/// True if the datagram is a discovery request
pub fn is_ping(datagram: &[u8]) -> bool {
    datagram == PING
}

/// True if the datagram is a discovery reply
pub fn is_pong(datagram: &[u8]) -> bool {
    datagram == PONG
}

/// UDP socket set up for the PING/PONG exchange
pub struct DiscoverySocket {
    socket: UdpSocket,
    port: u16,
}

impl DiscoverySocket {
    /// Bind on the given port with broadcast and address reuse enabled.
    /// The streamer binds the well-known port to be reachable; the monitor
    /// may pass 0 for an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, DiscoveryError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&addr.into())
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
        let port = socket
            .local_addr()
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?
            .port();
        Ok(Self { socket, port })
    }

    /// Send a `PING` to `target` (the local broadcast address in production,
    /// a unicast address when discovery is directed)
    pub async fn send_ping(&self, target: SocketAddr) -> Result<(), DiscoveryError> {
        self.socket
            .send_to(PING, target)
            .await
            .map_err(|e| DiscoveryError::BroadcastFailed(e.to_string()))?;
        Ok(())
    }

    /// Send a `PONG` back to a discovered peer
    pub async fn send_pong(&self, target: SocketAddr) -> Result<(), DiscoveryError> {
        self.socket
            .send_to(PONG, target)
            .await
            .map_err(|e| DiscoveryError::BroadcastFailed(e.to_string()))?;
        Ok(())
    }

    /// Receive one datagram; the caller classifies it with `is_ping`/`is_pong`
    pub async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), DiscoveryError> {
        let mut buf = [0u8; 64];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| DiscoveryError::ReceiveFailed(e.to_string()))?;
        Ok((buf[..len].to_vec(), from))
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }
}

/// Streamer-side responder: answer every `PING` with a `PONG` to the sender.
/// Anything else on the port is noise and is dropped. Runs until the socket
/// errors out.
pub async fn respond_loop(socket: DiscoverySocket) {
    loop {
        match socket.recv().await {
            Ok((datagram, from)) => {
                if is_ping(&datagram) {
                    tracing::debug!("PING from {}, answering", from);
                    if let Err(e) = socket.send_pong(from).await {
                        tracing::warn!("Failed to answer PING from {}: {}", from, e);
                    }
                } else {
                    tracing::debug!("Ignoring {} noise bytes from {}", datagram.len(), from);
                }
            }
            Err(e) => {
                tracing::warn!("Discovery responder stopping: {}", e);
                return;
            }
        }
    }
}
