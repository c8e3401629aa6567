//! Async UDP command channel

use std::net::SocketAddr;
use tandem_core::DeviceError;
use tokio::net::UdpSocket;
use tracing::trace;

/// Connected UDP socket to one device
///
/// Datagrams carry no acknowledgement: a successful `send` only means the OS
/// accepted the datagram.
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port and fix the peer address
    pub async fn open(target: SocketAddr) -> Result<Self, DeviceError> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one datagram; the whole payload must leave in one write
    pub async fn send(&self, payload: &[u8]) -> Result<(), DeviceError> {
        let sent = self.socket.send(payload).await?;
        if sent != payload.len() {
            return Err(DeviceError::Transport(format!(
                "short datagram: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        trace!(target = %self.target, len = payload.len(), "Sent datagram");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::open(peer.local_addr().unwrap()).await.unwrap();

        transport.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
