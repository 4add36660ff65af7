//! Media transport primitives
//!
//! Thin send/receive wrappers over the two channels the link uses: a
//! connectionless multicast datagram channel for the audio stream and a
//! connection-oriented TCP channel for session establishment. No protocol
//! logic lives here; payloads are opaque chunks and datagram boundaries are
//! the only delimiters.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};

use crate::constants::{MAX_DATAGRAM_SIZE, MULTICAST_TTL};
use crate::error::TransportError;

/// Sender side of the audio stream: one datagram per `send` call
pub struct StreamPublisher {
    socket: UdpSocket,
    target: SocketAddr,
}

impl StreamPublisher {
    /// Create a publisher addressed at `target` (the multicast group in
    /// production, any unicast address in tests) with link-local TTL
    pub async fn connect(target: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        Ok(Self { socket, target })
    }

    /// Send one audio chunk as a single datagram
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::DatagramTooLarge(payload.len()));
        }
        self.socket
            .send_to(payload, self.target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Receiver side of the audio stream
pub struct StreamSubscriber {
    socket: UdpSocket,
}

impl StreamSubscriber {
    /// Bind the stream port, optionally joining a multicast group. Address
    /// reuse is enabled so a restarted session can rebind immediately.
    pub async fn bind(port: u16, group: Option<Ipv4Addr>) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        if let Some(group) = group {
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        }
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        Ok(Self { socket })
    }

    /// Receive one datagram as an opaque chunk
    pub async fn recv(&self) -> Result<(Bytes, SocketAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        buf.truncate(len);
        Ok((Bytes::from(buf), from))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))
    }
}

/// Connection-oriented control channel to the discovered peer. The handshake
/// is "connect succeeds"; afterwards the stream is only watched for liveness.
pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    pub async fn connect(peer: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { stream })
    }

    /// Wait for the peer to close the connection or for a socket error.
    /// Either way the channel is dead when this returns.
    pub async fn closed(&mut self) -> TransportError {
        let mut buf = [0u8; 32];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => return TransportError::ConnectionClosed,
                Ok(_) => continue, // handshake chatter, ignored
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Err(e) = self.stream.readable().await {
                        return TransportError::ReceiveFailed(e.to_string());
                    }
                }
                Err(e) => return TransportError::ReceiveFailed(e.to_string()),
            }
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        self.stream
            .peer_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}
