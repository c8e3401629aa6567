//! Recording sessions and streamed sample buffers
//!
//! A [`RecordingSession`] covers exactly one `start_all` -> `stop_all` cycle.
//! It holds, per device, the host timestamps captured right after the device
//! acknowledged start and stop, plus what the device produced: an
//! acknowledgement for command-only devices or a [`SampleBuffer`] for
//! streaming devices. Consumers use the per-device timestamps to compute skew
//! and align independently clocked recordings offline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::device::{DeviceId, DeviceKind};
use crate::error::DeviceError;

/// Host clock reading taken at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timestamp {
    /// Monotonic offset from the orchestrator epoch
    pub monotonic: Duration,
    /// Wall-clock time, for naming and manifests
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    pub fn capture(epoch: Instant) -> Self {
        Self {
            monotonic: epoch.elapsed(),
            wall: Utc::now(),
        }
    }
}

/// One arrival unit of streamed data
///
/// `samples` is channel-major: `samples[channel][i]` was taken at
/// `timestamps[i]`. Every channel row has the same length as `timestamps`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    samples: Vec<Vec<f64>>,
    timestamps: Vec<f64>,
}

impl SampleBatch {
    pub fn new(samples: Vec<Vec<f64>>, timestamps: Vec<f64>) -> Result<Self, DeviceError> {
        if let Some(row) = samples.iter().position(|ch| ch.len() != timestamps.len()) {
            return Err(DeviceError::ProtocolViolation(format!(
                "channel {} has {} samples for {} timestamps",
                row,
                samples[row].len(),
                timestamps.len()
            )));
        }
        Ok(Self {
            samples,
            timestamps,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn samples(&self) -> &[Vec<f64>] {
        &self.samples
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }
}

/// Concatenation of a device's batches, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    channel_names: Vec<String>,
    samples: Vec<Vec<f64>>,
    timestamps: Vec<f64>,
}

impl SampleBuffer {
    pub fn new(channel_names: Vec<String>) -> Self {
        let samples = vec![Vec::new(); channel_names.len()];
        Self {
            channel_names,
            samples,
            timestamps: Vec::new(),
        }
    }

    /// Concatenate batches in the order given; never reorders
    pub fn from_batches(
        channel_names: Vec<String>,
        batches: impl IntoIterator<Item = SampleBatch>,
    ) -> Result<Self, DeviceError> {
        let mut buffer = Self::new(channel_names);
        for batch in batches {
            buffer.append(batch)?;
        }
        Ok(buffer)
    }

    pub fn append(&mut self, batch: SampleBatch) -> Result<(), DeviceError> {
        if batch.channel_count() != self.channel_names.len() {
            return Err(DeviceError::ProtocolViolation(format!(
                "batch has {} channels, buffer expects {}",
                batch.channel_count(),
                self.channel_names.len()
            )));
        }
        for (row, values) in self.samples.iter_mut().zip(batch.samples) {
            row.extend(values);
        }
        self.timestamps.extend(batch.timestamps);
        Ok(())
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Channel-major sample matrix
    pub fn samples(&self) -> &[Vec<f64>] {
        &self.samples
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Row `i` across all channels
    pub fn row(&self, i: usize) -> Option<Vec<f64>> {
        if i >= self.len() {
            return None;
        }
        Some(self.samples.iter().map(|ch| ch[i]).collect())
    }
}

/// What a device produced when it stopped
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// Command-only device confirmed the stop
    Acknowledged,
    /// Streaming device handed over its samples
    Samples(SampleBuffer),
}

/// Per-device slot of a recording session
#[derive(Debug, Clone)]
pub struct DeviceRecording {
    pub device: DeviceId,
    pub kind: DeviceKind,
    pub label: String,
    pub started: Timestamp,
    pub stopped: Option<Timestamp>,
    pub capture: Option<Capture>,
}

impl DeviceRecording {
    pub fn new(device: DeviceId, kind: DeviceKind, label: String, started: Timestamp) -> Self {
        Self {
            device,
            kind,
            label,
            started,
            stopped: None,
            capture: None,
        }
    }

    /// Whether the device confirmed both start and stop
    pub fn acknowledged(&self) -> bool {
        self.stopped.is_some() && self.capture.is_some()
    }

    pub fn samples(&self) -> Option<&SampleBuffer> {
        match &self.capture {
            Some(Capture::Samples(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// Length of the recording as seen by the host clock
    pub fn duration(&self) -> Option<Duration> {
        self.stopped
            .map(|stop| stop.monotonic.saturating_sub(self.started.monotonic))
    }
}

/// The aggregate result of one start -> stop cycle
#[derive(Debug, Clone)]
pub struct RecordingSession {
    id: Uuid,
    opened_at: DateTime<Utc>,
    closed: bool,
    devices: BTreeMap<DeviceId, DeviceRecording>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            closed: false,
            devices: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn insert(&mut self, recording: DeviceRecording) {
        self.devices.insert(recording.device.clone(), recording);
    }

    pub(crate) fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecording> {
        self.devices.get_mut(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecording> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecording> {
        self.devices.values()
    }

    pub fn into_devices(self) -> Vec<DeviceRecording> {
        self.devices.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Start-time difference `b - a` in seconds (negative if `b` started first)
    pub fn start_skew(&self, a: &DeviceId, b: &DeviceId) -> Option<f64> {
        let a = self.devices.get(a)?.started.monotonic.as_secs_f64();
        let b = self.devices.get(b)?.started.monotonic.as_secs_f64();
        Some(b - a)
    }

    /// Spread between the earliest and latest start acknowledgement
    pub fn max_start_skew(&self) -> Duration {
        let starts = self.devices.values().map(|d| d.started.monotonic);
        match (starts.clone().min(), starts.max()) {
            (Some(min), Some(max)) => max - min,
            _ => Duration::ZERO,
        }
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_batch_rejects_mismatched_lengths() {
        let err = SampleBatch::new(vec![vec![1.0, 2.0], vec![3.0]], vec![0.0, 0.1]).unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolViolation(_)));
    }

    #[test]
    fn test_buffer_concatenates_in_arrival_order() {
        let first = SampleBatch::new(vec![vec![1.0, 2.0], vec![10.0, 20.0]], vec![0.0, 0.1]).unwrap();
        let second = SampleBatch::new(vec![vec![3.0], vec![30.0]], vec![0.05]).unwrap();

        let buffer = SampleBuffer::from_batches(names(), vec![first, second]).unwrap();

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.samples()[0], vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.samples()[1], vec![10.0, 20.0, 30.0]);
        // Out-of-order hardware time is kept as received
        assert_eq!(buffer.timestamps(), &[0.0, 0.1, 0.05]);
        for row in buffer.samples() {
            assert_eq!(row.len(), buffer.timestamps().len());
        }
        assert_eq!(buffer.row(2), Some(vec![3.0, 30.0]));
        assert_eq!(buffer.row(3), None);
    }

    #[test]
    fn test_buffer_rejects_wrong_channel_count() {
        let mut buffer = SampleBuffer::new(names());
        let batch = SampleBatch::new(vec![vec![1.0]], vec![0.0]).unwrap();
        assert!(buffer.append(batch).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_session_skew() {
        let mut session = RecordingSession::new();
        let at = |ms: u64| Timestamp {
            monotonic: Duration::from_millis(ms),
            wall: Utc::now(),
        };
        session.insert(DeviceRecording::new(
            DeviceId::new("cam"),
            DeviceKind::UdpCamera,
            "cam".to_string(),
            at(120),
        ));
        session.insert(DeviceRecording::new(
            DeviceId::new("eeg"),
            DeviceKind::BleBiosignal,
            "eeg".to_string(),
            at(45),
        ));

        let skew = session
            .start_skew(&DeviceId::new("cam"), &DeviceId::new("eeg"))
            .unwrap();
        assert!((skew + 0.075).abs() < 1e-9);
        assert_eq!(session.max_start_skew(), Duration::from_millis(75));
    }
}
