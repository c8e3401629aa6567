//! Companion phone over a plain TCP stream
//!
//! One byte per command: `0x01` starts recording, `0x00` stops it. The
//! client closes the stream after the stop byte.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tandem_core::{Capture, DeviceAddress, DeviceClient, DeviceError, DeviceKind, Locator};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const START_BYTE: u8 = 0x01;
pub const STOP_BYTE: u8 = 0x00;

pub struct CompanionClient {
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl CompanionClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            stream: None,
            peer: None,
        }
    }

    async fn send_byte(&mut self, byte: u8) -> Result<(), DeviceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState("companion not connected".into()))?;

        // The socket was connected, so any write failure means the link dropped
        let sent = async {
            stream.write_all(&[byte]).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = sent {
            warn!(peer = ?self.peer, error = %e, "Companion link dropped");
            self.stream = None;
            return Err(DeviceError::ConnectionLost(e.to_string()));
        }
        debug!(peer = ?self.peer, byte = byte, "Sent companion command");
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for CompanionClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::TcpCompanion
    }

    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError> {
        match locator {
            Locator::Endpoint { ip, port } => Ok(DeviceAddress::Socket(SocketAddr::new(*ip, *port))),
            other => Err(DeviceError::UnsupportedOperation(format!(
                "companion needs a fixed endpoint, got {:?}",
                other
            ))),
        }
    }

    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        let DeviceAddress::Socket(peer) = address else {
            return Err(DeviceError::InvalidState(format!(
                "companion cannot connect to {}",
                address
            )));
        };
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| DeviceError::ConnectionTimeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;

        info!(peer = %peer, "Companion connected");
        self.stream = Some(stream);
        self.peer = Some(*peer);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn start_recording(&mut self) -> Result<(), DeviceError> {
        self.send_byte(START_BYTE).await
    }

    async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
        self.send_byte(STOP_BYTE).await?;
        self.disconnect().await;
        Ok(Capture::Acknowledged)
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(peer = ?self.peer, error = %e, "Companion shutdown failed");
            }
            debug!(peer = ?self.peer, "Companion closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_start_stop_bytes_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let phone = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            // Completes only once the client closes the stream
            socket.read_to_end(&mut received).await.unwrap();
            let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
            (received, second.is_err())
        });

        let mut client = CompanionClient::new(Duration::from_secs(2));
        let address = DeviceAddress::Socket(addr);
        client.connect(&address).await.unwrap();
        client.connect(&address).await.unwrap();
        client.start_recording().await.unwrap();
        assert_eq!(client.stop_recording().await.unwrap(), Capture::Acknowledged);
        assert!(!client.is_connected());

        let (received, single_connection) = phone.await.unwrap();
        assert_eq!(received, vec![START_BYTE, STOP_BYTE]);
        assert!(single_connection);
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = CompanionClient::new(Duration::from_secs(2));
        let err = client.connect(&DeviceAddress::Socket(addr)).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Transport(_) | DeviceError::ConnectionLost(_)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_stop_without_connection() {
        let mut client = CompanionClient::new(Duration::from_secs(1));
        assert!(matches!(
            client.stop_recording().await,
            Err(DeviceError::InvalidState(_))
        ));
    }
}
