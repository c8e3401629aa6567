//! Fire-and-forget UDP camera control
//!
//! The camera listens on a fixed IP/port. Connecting sends a handshake
//! datagram; start and stop each send one opcode datagram. Nothing is
//! acknowledged, so only OS-level send failures surface as errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tandem_core::{Capture, DeviceAddress, DeviceClient, DeviceError, DeviceKind, Locator};
use tracing::{debug, info};

use crate::transport::UdpTransport;

/// Default control port
pub const DEFAULT_UDP_CAMERA_PORT: u16 = 5111;

/// Payloads of the three control datagrams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpCameraCommands {
    pub handshake: Vec<u8>,
    pub start: Vec<u8>,
    pub stop: Vec<u8>,
}

impl Default for UdpCameraCommands {
    fn default() -> Self {
        Self {
            handshake: b"mode=accctrl&type=req_acc".to_vec(),
            start: b"mode=camcmd&value=video_recstart".to_vec(),
            stop: b"mode=camcmd&value=video_recstop".to_vec(),
        }
    }
}

pub struct UdpCameraClient {
    commands: UdpCameraCommands,
    transport: Option<UdpTransport>,
}

impl UdpCameraClient {
    pub fn new(commands: UdpCameraCommands) -> Self {
        Self {
            commands,
            transport: None,
        }
    }

    fn transport(&self) -> Result<&UdpTransport, DeviceError> {
        self.transport
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidState("UDP camera not connected".into()))
    }
}

#[async_trait]
impl DeviceClient for UdpCameraClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::UdpCamera
    }

    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError> {
        match locator {
            Locator::Endpoint { ip, port } => Ok(DeviceAddress::Socket(SocketAddr::new(*ip, *port))),
            other => Err(DeviceError::UnsupportedOperation(format!(
                "UDP camera needs a fixed endpoint, got {:?}",
                other
            ))),
        }
    }

    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        let DeviceAddress::Socket(target) = address else {
            return Err(DeviceError::InvalidState(format!(
                "UDP camera cannot connect to {}",
                address
            )));
        };
        if self.transport.as_ref().is_some_and(|t| t.target() == *target) {
            return Ok(());
        }

        let transport = UdpTransport::open(*target).await?;
        transport.send(&self.commands.handshake).await?;
        info!(target = %target, "UDP camera handshake sent");
        self.transport = Some(transport);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    async fn start_recording(&mut self) -> Result<(), DeviceError> {
        self.transport()?.send(&self.commands.start).await
    }

    async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
        self.transport()?.send(&self.commands.stop).await?;
        Ok(Capture::Acknowledged)
    }

    async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            debug!(target = %transport.target(), "UDP camera released");
        }
    }
}
