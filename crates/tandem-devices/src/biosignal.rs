//! EEG headset streaming over BLE notifications
//!
//! Each EEG electrode has its own characteristic. A notification is 20 bytes:
//! a big-endian u16 packet index, then twelve 12-bit samples packed
//! back to back. All electrodes share the packet index, so one sample batch is
//! complete once every channel delivered the same index.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tandem_core::{
    Capture, DeviceAddress, DeviceClient, DeviceError, DeviceId, DeviceKind, Locator,
    SampleBatch, SampleBuffer,
};
use tandem_discovery::{BleDevice, SharedDiscoveryCache};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatt;

const fn headset_uuid(suffix: u16) -> Uuid {
    Uuid::from_u128(0x273e_0000_4c4d_454d_96be_f03b_ac82_1358 | ((suffix as u128) << 96))
}

pub const CONTROL: Uuid = headset_uuid(0x0001);

pub const EEG_CHANNEL_COUNT: usize = 5;

pub const EEG_CHANNELS: [&str; EEG_CHANNEL_COUNT] = ["TP9", "AF7", "AF8", "TP10", "Right AUX"];

/// Data characteristics, in `EEG_CHANNELS` order
pub const EEG_CHARACTERISTICS: [Uuid; EEG_CHANNEL_COUNT] = [
    headset_uuid(0x0003),
    headset_uuid(0x0004),
    headset_uuid(0x0005),
    headset_uuid(0x0006),
    headset_uuid(0x0007),
];

pub const SAMPLES_PER_PACKET: usize = 12;
pub const SAMPLE_RATE_HZ: f64 = 256.0;
pub const MICROVOLTS_PER_COUNT: f64 = 0.48828125;

const PACKET_LEN: usize = 2 + SAMPLES_PER_PACKET * 3 / 2;

/// Control command frame: `[len, ascii..., '\n']`
pub fn control_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 2);
    frame.push((command.len() + 1) as u8);
    frame.extend_from_slice(command.as_bytes());
    frame.push(b'\n');
    frame
}

/// Decode one notification into its packet index and microvolt samples
pub fn decode_eeg_packet(data: &[u8]) -> Result<(u16, [f64; SAMPLES_PER_PACKET]), DeviceError> {
    if data.len() < PACKET_LEN {
        return Err(DeviceError::ProtocolViolation(format!(
            "EEG packet of {} bytes, expected {}",
            data.len(),
            PACKET_LEN
        )));
    }
    let index = u16::from_be_bytes([data[0], data[1]]);

    let mut samples = [0.0; SAMPLES_PER_PACKET];
    for (pair, bytes) in data[2..PACKET_LEN].chunks_exact(3).enumerate() {
        let first = ((bytes[0] as u16) << 4) | ((bytes[1] as u16) >> 4);
        let second = (((bytes[1] & 0x0f) as u16) << 8) | bytes[2] as u16;
        samples[pair * 2] = MICROVOLTS_PER_COUNT * (first as f64 - 2048.0);
        samples[pair * 2 + 1] = MICROVOLTS_PER_COUNT * (second as f64 - 2048.0);
    }
    Ok((index, samples))
}

/// Groups per-channel packets into sample batches by packet index
#[derive(Debug, Default)]
pub struct PacketAssembler {
    pending_index: Option<u16>,
    pending: [Option<[f64; SAMPLES_PER_PACKET]>; EEG_CHANNEL_COUNT],
    last_emitted: Option<u16>,
    wraps: u64,
    dropped: u64,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incomplete packets discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Add one channel's packet; returns a batch once all channels of `index` arrived
    pub fn push(
        &mut self,
        channel: usize,
        index: u16,
        samples: [f64; SAMPLES_PER_PACKET],
    ) -> Option<SampleBatch> {
        if channel >= EEG_CHANNEL_COUNT {
            return None;
        }

        if self.pending_index != Some(index) {
            if self.pending.iter().any(Option::is_some) {
                self.dropped += 1;
                debug!(
                    index = ?self.pending_index,
                    superseded_by = index,
                    "Dropping incomplete EEG packet"
                );
            }
            self.pending = [None; EEG_CHANNEL_COUNT];
            self.pending_index = Some(index);
        }
        self.pending[channel] = Some(samples);

        if !self.pending.iter().all(Option::is_some) {
            return None;
        }

        let base = self.unwrap_index(index) * SAMPLES_PER_PACKET as u64;
        let rows: Vec<Vec<f64>> = self.pending.iter().flatten().map(|s| s.to_vec()).collect();
        let timestamps = (0..SAMPLES_PER_PACKET as u64)
            .map(|i| (base + i) as f64 / SAMPLE_RATE_HZ)
            .collect();
        self.pending = [None; EEG_CHANNEL_COUNT];
        self.pending_index = None;

        SampleBatch::new(rows, timestamps).ok()
    }

    fn unwrap_index(&mut self, index: u16) -> u64 {
        if let Some(last) = self.last_emitted {
            if index < last && last - index > u16::MAX / 2 {
                self.wraps += 1;
            }
        }
        self.last_emitted = Some(index);
        self.wraps * (u16::MAX as u64 + 1) + index as u64
    }
}

/// Consume notifications until the stream ends or `stop` fires
///
/// Notifications already delivered when `stop` fires are still decoded. The
/// only writer of the returned batches; the caller reads them after the task
/// has finished.
pub async fn collect_batches<S>(mut notifications: S, stop: CancellationToken) -> Vec<SampleBatch>
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut assembler = PacketAssembler::new();
    let mut batches = Vec::new();

    loop {
        // Queued notifications win over the stop signal so stop drains them
        let notification = tokio::select! {
            biased;
            next = notifications.next() => match next {
                Some(notification) => notification,
                None => break,
            },
            _ = stop.cancelled() => break,
        };
        let Some(channel) = EEG_CHARACTERISTICS
            .iter()
            .position(|uuid| *uuid == notification.uuid)
        else {
            continue;
        };
        match decode_eeg_packet(&notification.value) {
            Ok((index, samples)) => {
                if let Some(batch) = assembler.push(channel, index, samples) {
                    batches.push(batch);
                }
            }
            Err(e) => warn!(channel = EEG_CHANNELS[channel], error = %e, "Bad EEG packet"),
        }
    }

    debug!(
        batches = batches.len(),
        dropped = assembler.dropped(),
        "EEG stream closed"
    );
    batches
}

/// Wait for `consumer`, run `teardown` whatever its outcome, then report it
async fn join_then<T>(
    consumer: JoinHandle<T>,
    teardown: impl std::future::Future<Output = ()>,
) -> Result<T, DeviceError> {
    let joined = consumer.await;
    teardown.await;
    joined.map_err(|e| DeviceError::Transport(format!("EEG consumer failed: {}", e)))
}

struct Streaming {
    stop: CancellationToken,
    consumer: JoinHandle<Vec<SampleBatch>>,
}

pub struct BiosignalClient {
    owner: DeviceId,
    cache: SharedDiscoveryCache,
    connect_timeout: Duration,
    found: Option<BleDevice>,
    peripheral: Option<Peripheral>,
    streaming: Option<Streaming>,
}

impl BiosignalClient {
    pub fn new(owner: DeviceId, cache: SharedDiscoveryCache, connect_timeout: Duration) -> Self {
        Self {
            owner,
            cache,
            connect_timeout,
            found: None,
            peripheral: None,
            streaming: None,
        }
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
        gatt::find_characteristic(peripheral, uuid).ok_or_else(|| {
            DeviceError::ProtocolViolation(format!("characteristic {} missing", uuid))
        })
    }

    async fn write_control(
        peripheral: &Peripheral,
        control: &Characteristic,
        command: &str,
    ) -> Result<(), DeviceError> {
        peripheral
            .write(control, &control_command(command), WriteType::WithoutResponse)
            .await
            .map_err(gatt::ble_error)
    }

    async fn begin_streaming(&self, peripheral: &Peripheral) -> Result<Streaming, DeviceError> {
        let control = Self::characteristic(peripheral, CONTROL)?;
        let notifications = peripheral.notifications().await.map_err(gatt::ble_error)?;
        for uuid in EEG_CHARACTERISTICS {
            let characteristic = Self::characteristic(peripheral, uuid)?;
            peripheral
                .subscribe(&characteristic)
                .await
                .map_err(gatt::ble_error)?;
        }

        let stop = CancellationToken::new();
        let consumer = tokio::spawn(collect_batches(notifications, stop.clone()));
        let streaming = Streaming { stop, consumer };

        for command in ["h", "p21", "d"] {
            if let Err(e) = Self::write_control(peripheral, &control, command).await {
                streaming.stop.cancel();
                streaming.consumer.abort();
                return Err(e);
            }
        }
        Ok(streaming)
    }
}

#[async_trait]
impl DeviceClient for BiosignalClient {
    fn kind(&self) -> DeviceKind {
        DeviceKind::BleBiosignal
    }

    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError> {
        let (device, address) = gatt::discover(&self.cache, &self.owner, locator).await?;
        info!(device = %self.owner, headset = %address, "Headset found");
        self.found = Some(device);
        Ok(address)
    }

    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        if self.peripheral.is_some() {
            return Ok(());
        }
        let peripheral = gatt::peripheral_for(self.found.as_ref(), address)?;
        let mut required = vec![CONTROL];
        required.extend(EEG_CHARACTERISTICS);
        gatt::connect(&peripheral, self.connect_timeout, &required).await?;

        info!(device = %self.owner, address = %address, "Headset connected");
        self.peripheral = Some(peripheral);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.peripheral.is_some()
    }

    async fn start_recording(&mut self) -> Result<(), DeviceError> {
        if self.streaming.is_some() {
            return Err(DeviceError::InvalidState("headset already streaming".into()));
        }
        let peripheral = self
            .peripheral
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidState("headset not connected".into()))?;

        let streaming = self.begin_streaming(peripheral).await?;
        info!(device = %self.owner, "EEG streaming started");
        self.streaming = Some(streaming);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
        let streaming = self
            .streaming
            .take()
            .ok_or_else(|| DeviceError::InvalidState("headset not streaming".into()))?;

        if let Some(peripheral) = &self.peripheral {
            if let Ok(control) = Self::characteristic(peripheral, CONTROL) {
                if let Err(e) = Self::write_control(peripheral, &control, "h").await {
                    debug!(device = %self.owner, error = %e, "Halt command failed");
                }
            }
            for uuid in EEG_CHARACTERISTICS {
                if let Some(characteristic) = gatt::find_characteristic(peripheral, uuid) {
                    if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                        debug!(device = %self.owner, error = %e, "Unsubscribe failed");
                    }
                }
            }
        }

        streaming.stop.cancel();
        let batches = join_then(streaming.consumer, self.disconnect()).await?;

        let names = EEG_CHANNELS.iter().map(|n| n.to_string()).collect();
        let buffer = SampleBuffer::from_batches(names, batches)?;
        info!(device = %self.owner, samples = buffer.len(), "EEG streaming stopped");
        Ok(Capture::Samples(buffer))
    }

    async fn disconnect(&mut self) {
        if let Some(streaming) = self.streaming.take() {
            streaming.stop.cancel();
            streaming.consumer.abort();
        }
        if let Some(peripheral) = self.peripheral.take() {
            gatt::release(&peripheral).await;
            debug!(device = %self.owner, "Headset disconnected");
        }
    }
}
