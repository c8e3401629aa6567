//! Action camera controlled over BLE GATT
//!
//! Commands are TLV frames written with acknowledged delivery to the command
//! request characteristic:
//!
//! ```text
//! [total length, command id, value length, value...]
//! ```
//!
//! The camera answers on the command response characteristic with
//! `[length, command id, status]`; status 0 means success.

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tandem_core::{
    Capture, DeviceAddress, DeviceClient, DeviceError, DeviceId, DeviceKind, Locator,
    ProtocolError,
};
use tandem_discovery::{BleDevice, SharedDiscoveryCache};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatt;

/// Advertised-name pattern of the cameras
pub const NAME_PATTERN: &str = "GoPro [A-Z0-9]{4}";

/// Build a camera characteristic UUID from its 16-bit suffix
pub const fn camera_uuid(suffix: u16) -> Uuid {
    Uuid::from_u128(0xb5f9_0000_aa8d_11e3_9046_0002_a5d5_c51b | ((suffix as u128) << 96))
}

pub const COMMAND_REQUEST: Uuid = camera_uuid(0x0072);
pub const COMMAND_RESPONSE: Uuid = camera_uuid(0x0073);
pub const SETTINGS_REQUEST: Uuid = camera_uuid(0x0074);
pub const SETTINGS_RESPONSE: Uuid = camera_uuid(0x0075);
pub const QUERY_REQUEST: Uuid = camera_uuid(0x0076);
pub const QUERY_RESPONSE: Uuid = camera_uuid(0x0077);

pub const CMD_SHUTTER: u8 = 0x01;

pub const SHUTTER_ON: [u8; 4] = [3, CMD_SHUTTER, 1, 1];
pub const SHUTTER_OFF: [u8; 4] = [3, CMD_SHUTTER, 1, 0];

/// Largest payload a single-packet frame header can describe
const MAX_FRAME_PAYLOAD: usize = 19;

/// Default wait for a command response before trusting the write acknowledgement
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Encode a command frame
pub fn command_frame(command: u8, value: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let mut frame = Vec::with_capacity(3 + value.len());
    if value.is_empty() {
        frame.extend_from_slice(&[1, command]);
    } else {
        let payload = 2 + value.len();
        if payload > MAX_FRAME_PAYLOAD {
            return Err(DeviceError::ProtocolViolation(format!(
                "command value of {} bytes does not fit one frame",
                value.len()
            )));
        }
        frame.extend_from_slice(&[payload as u8, command, value.len() as u8]);
        frame.extend_from_slice(value);
    }
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    pub command: u8,
    pub status: u8,
}

impl CommandResponse {
    pub fn decode(frame: &[u8]) -> Result<Self, DeviceError> {
        match frame {
            [len, command, status, ..] if *len >= 2 => Ok(Self {
                command: *command,
                status: *status,
            }),
            _ => Err(DeviceError::ProtocolViolation(format!(
                "bad command response frame {:02x?}",
                frame
            ))),
        }
    }

    pub fn into_result(self) -> Result<(), DeviceError> {
        if self.status == 0 {
            Ok(())
        } else {
            Err(ProtocolError::CommandRejected {
                command: self.command,
                status: self.status,
            }
            .into())
        }
    }
}

/// Read responses until the one for `command` arrives or `deadline` passes
///
/// Responses to other commands are skipped. Returns whether the camera
/// answered; a rejection is an error.
pub async fn await_response(
    responses: &mut mpsc::Receiver<Vec<u8>>,
    command: u8,
    deadline: Instant,
) -> Result<bool, DeviceError> {
    loop {
        match tokio::time::timeout_at(deadline, responses.recv()).await {
            Ok(Some(frame)) => {
                let response = CommandResponse::decode(&frame)?;
                if response.command == command {
                    return response.into_result().map(|()| true);
                }
                debug!(command = response.command, "Ignoring response to another command");
            }
            Ok(None) | Err(_) => return Ok(false),
        }
    }
}

/// Command responses the camera still owes
///
/// A command succeeds once its write is acknowledged. A response that has
/// already arrived is checked on the spot; otherwise the check is settled
/// before the next command, waiting out whatever is left of its window.
/// Silence for the whole window is taken as success.
pub struct ResponseTracker {
    responses: Option<mpsc::Receiver<Vec<u8>>>,
    window: Duration,
    owed: Option<(u8, Instant)>,
}

impl ResponseTracker {
    pub fn new(responses: Option<mpsc::Receiver<Vec<u8>>>, window: Duration) -> Self {
        Self {
            responses,
            window,
            owed: None,
        }
    }

    /// Command id whose response is still outstanding
    pub fn owed(&self) -> Option<u8> {
        self.owed.map(|(command, _)| command)
    }

    async fn settle(&mut self) -> Result<(), DeviceError> {
        let Some(responses) = self.responses.as_mut() else {
            return Ok(());
        };
        if let Some((command, deadline)) = self.owed.take() {
            if !await_response(responses, command, deadline).await? {
                debug!(command = command, "No command response, trusting write acknowledgement");
            }
        }
        while responses.try_recv().is_ok() {}
        Ok(())
    }

    /// Send `frame` through `write` once earlier responses are settled
    pub async fn send<F, Fut>(&mut self, frame: &[u8], write: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DeviceError>>,
    {
        self.settle().await?;
        write().await?;

        let (Some(responses), Some(&command)) = (self.responses.as_mut(), frame.get(1)) else {
            return Ok(());
        };
        if !await_response(responses, command, Instant::now()).await? {
            self.owed = Some((command, Instant::now() + self.window));
        }
        Ok(())
    }
}

struct Connection {
    peripheral: Peripheral,
    request: Characteristic,
    tracker: ResponseTracker,
    listener: Option<JoinHandle<()>>,
}

pub struct GattCameraClient {
    owner: DeviceId,
    cache: SharedDiscoveryCache,
    connect_timeout: Duration,
    response_timeout: Duration,
    found: Option<BleDevice>,
    link: Option<Connection>,
}

impl GattCameraClient {
    pub fn new(
        owner: DeviceId,
        cache: SharedDiscoveryCache,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            owner,
            cache,
            connect_timeout,
            response_timeout,
            found: None,
            link: None,
        }
    }

    async fn listen_for_responses(
        peripheral: &Peripheral,
    ) -> Result<Option<(mpsc::Receiver<Vec<u8>>, JoinHandle<()>)>, DeviceError> {
        let Some(response) = gatt::find_characteristic(peripheral, COMMAND_RESPONSE) else {
            return Ok(None);
        };
        if !response.properties.contains(CharPropFlags::NOTIFY) {
            return Ok(None);
        }
        peripheral.subscribe(&response).await.map_err(gatt::ble_error)?;
        let mut notifications = peripheral.notifications().await.map_err(gatt::ble_error)?;

        let (tx, rx) = mpsc::channel(16);
        let listener = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != COMMAND_RESPONSE {
                    continue;
                }
                // Drop rather than block the BLE event stream
                if tx.try_send(notification.value).is_err() && tx.is_closed() {
                    break;
                }
            }
        });
        Ok(Some((rx, listener)))
    }

    async fn send_command(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        let write_timeout = self.connect_timeout;
        let Connection {
            peripheral,
            request,
            tracker,
            ..
        } = self
            .link
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState("camera not connected".into()))?;

        let peripheral = &*peripheral;
        let request = &*request;
        tracker
            .send(frame, || async move {
                tokio::time::timeout(
                    write_timeout,
                    peripheral.write(request, frame, WriteType::WithResponse),
                )
                .await
                .map_err(|_| DeviceError::ConnectionTimeout(write_timeout))?
                .map_err(gatt::ble_error)
            })
            .await?;
        debug!(device = %self.owner, frame = ?frame, "Command acknowledged");
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for GattCameraClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::BleCamera
    }

    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError> {
        let (device, address) = gatt::discover(&self.cache, &self.owner, locator).await?;
        info!(device = %self.owner, camera = %address, "Camera found");
        self.found = Some(device);
        Ok(address)
    }

    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        if self.link.is_some() {
            return Ok(());
        }
        let peripheral = gatt::peripheral_for(self.found.as_ref(), address)?;
        gatt::connect(&peripheral, self.connect_timeout, &[COMMAND_REQUEST]).await?;
        let Some(request) = gatt::find_characteristic(&peripheral, COMMAND_REQUEST) else {
            gatt::release(&peripheral).await;
            return Err(DeviceError::ProtocolViolation(
                "command request characteristic missing".into(),
            ));
        };

        let (responses, listener) = match Self::listen_for_responses(&peripheral).await {
            Ok(Some((rx, handle))) => (Some(rx), Some(handle)),
            Ok(None) => (None, None),
            Err(e) => {
                warn!(device = %self.owner, error = %e, "Command responses unavailable");
                (None, None)
            }
        };

        info!(device = %self.owner, address = %address, "Camera connected");
        self.link = Some(Connection {
            peripheral,
            request,
            tracker: ResponseTracker::new(responses, self.response_timeout),
            listener,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    async fn start_recording(&mut self) -> Result<(), DeviceError> {
        self.send_command(&SHUTTER_ON).await
    }

    async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
        self.send_command(&SHUTTER_OFF).await?;
        Ok(Capture::Acknowledged)
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Some(listener) = link.listener {
                listener.abort();
            }
            gatt::release(&link.peripheral).await;
            debug!(device = %self.owner, "Camera disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            COMMAND_REQUEST.to_string(),
            "b5f90072-aa8d-11e3-9046-0002a5d5c51b"
        );
        assert_eq!(
            QUERY_RESPONSE.to_string(),
            "b5f90077-aa8d-11e3-9046-0002a5d5c51b"
        );
        assert_ne!(SETTINGS_REQUEST, SETTINGS_RESPONSE);
    }

    #[test]
    fn test_shutter_frames() {
        assert_eq!(command_frame(CMD_SHUTTER, &[1]).unwrap(), SHUTTER_ON.to_vec());
        assert_eq!(command_frame(CMD_SHUTTER, &[0]).unwrap(), SHUTTER_OFF.to_vec());
        assert_eq!(SHUTTER_ON, [3, 1, 1, 1]);
        assert_eq!(SHUTTER_OFF, [3, 1, 1, 0]);
        assert_eq!(command_frame(0x05, &[]).unwrap(), vec![1, 0x05]);
        assert!(command_frame(0x01, &[0u8; 18]).is_err());
    }

    #[test]
    fn test_response_decoding() {
        let ok = CommandResponse::decode(&[2, 1, 0]).unwrap();
        assert_eq!(ok, CommandResponse { command: 1, status: 0 });
        assert!(ok.into_result().is_ok());

        let busy = CommandResponse::decode(&[2, 1, 2]).unwrap();
        assert_eq!(
            busy.into_result(),
            Err(DeviceError::Protocol(ProtocolError::CommandRejected {
                command: 1,
                status: 2
            }))
        );

        assert!(matches!(
            CommandResponse::decode(&[2, 1]),
            Err(DeviceError::ProtocolViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_response_matches_command() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(vec![2, 0x17, 0]).await.unwrap();
        tx.send(vec![2, CMD_SHUTTER, 1]).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let result = await_response(&mut rx, CMD_SHUTTER, deadline).await;
        assert_eq!(
            result,
            Err(DeviceError::Protocol(ProtocolError::CommandRejected {
                command: CMD_SHUTTER,
                status: 1
            }))
        );
    }

    fn acknowledged_after(delay: Duration) -> impl Future<Output = Result<(), DeviceError>> {
        async move {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_camera_returns_on_write_acknowledgement() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(4);
        let mut tracker = ResponseTracker::new(Some(rx), DEFAULT_RESPONSE_TIMEOUT);

        let before = Instant::now();
        tracker
            .send(&SHUTTER_ON, || acknowledged_after(Duration::from_millis(80)))
            .await
            .unwrap();
        assert_eq!(before.elapsed(), Duration::from_millis(80));
        assert_eq!(tracker.owed(), Some(CMD_SHUTTER));

        tokio::time::advance(Duration::from_secs(10)).await;
        let before = Instant::now();
        tracker
            .send(&SHUTTER_OFF, || acknowledged_after(Duration::from_millis(80)))
            .await
            .unwrap();
        assert_eq!(before.elapsed(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_rejection_fails_the_command() {
        let (tx, rx) = mpsc::channel(4);
        let mut tracker = ResponseTracker::new(Some(rx), DEFAULT_RESPONSE_TIMEOUT);

        let result = tracker
            .send(&SHUTTER_ON, || async {
                tx.send(vec![2, CMD_SHUTTER, 2]).await.unwrap();
                Ok(())
            })
            .await;
        assert_eq!(
            result,
            Err(DeviceError::Protocol(ProtocolError::CommandRejected {
                command: CMD_SHUTTER,
                status: 2
            }))
        );
        assert_eq!(tracker.owed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_rejection_surfaces_before_next_command() {
        let (tx, rx) = mpsc::channel(4);
        let mut tracker = ResponseTracker::new(Some(rx), DEFAULT_RESPONSE_TIMEOUT);
        tracker
            .send(&SHUTTER_ON, || acknowledged_after(Duration::ZERO))
            .await
            .unwrap();

        tx.send(vec![2, CMD_SHUTTER, 3]).await.unwrap();
        let mut wrote = false;
        let result = tracker
            .send(&SHUTTER_OFF, || {
                wrote = true;
                acknowledged_after(Duration::ZERO)
            })
            .await;
        assert!(matches!(
            result,
            Err(DeviceError::Protocol(ProtocolError::CommandRejected { status: 3, .. }))
        ));
        assert!(!wrote);
    }

    #[tokio::test]
    async fn test_without_response_channel_only_the_write_counts() {
        let mut tracker = ResponseTracker::new(None, DEFAULT_RESPONSE_TIMEOUT);
        tracker
            .send(&SHUTTER_ON, || acknowledged_after(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(tracker.owed(), None);
    }
}
