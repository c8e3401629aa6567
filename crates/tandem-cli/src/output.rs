//! Session persistence: per-device CSV files and a JSON manifest

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tandem_core::{DeviceKind, ErrorKind, ErrorRecord, Operation, RecordingSession, SampleBuffer};
use tracing::info;
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "session.json";

/// `recording_<label>_<YYYY-mm-dd-HH.MM.SS>.csv`
pub fn recording_file_name(label: &str, at: DateTime<Utc>) -> String {
    format!("recording_{}_{}.csv", label, at.format("%Y-%m-%d-%H.%M.%S"))
}

/// Write a sample buffer as CSV: row index, one column per channel, then timestamps
pub fn write_samples_csv<W: Write>(out: W, buffer: &SampleBuffer) -> std::io::Result<()> {
    let mut out = BufWriter::new(out);

    let mut header = String::new();
    for name in buffer.channel_names() {
        header.push(',');
        header.push_str(name);
    }
    writeln!(out, "{},timestamps", header)?;

    for (i, timestamp) in buffer.timestamps().iter().enumerate() {
        write!(out, "{}", i)?;
        for channel in buffer.samples() {
            write!(out, ",{:.3}", channel[i])?;
        }
        writeln!(out, ",{:.3}", timestamp)?;
    }
    out.flush()
}

#[derive(Debug, Serialize)]
pub struct SessionManifest {
    pub session_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub max_start_skew_secs: f64,
    pub devices: Vec<DeviceEntry>,
    pub failures: Vec<FailureEntry>,
}

#[derive(Debug, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub started_offset_secs: f64,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stopped_offset_secs: Option<f64>,
    pub acknowledged: bool,
    pub samples: Option<usize>,
    pub file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FailureEntry {
    pub device: String,
    pub operation: Operation,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ErrorRecord> for FailureEntry {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            device: record.device.to_string(),
            operation: record.operation,
            kind: record.kind(),
            message: record.error.to_string(),
        }
    }
}

/// What `persist` wrote
#[derive(Debug)]
pub struct Persisted {
    pub files: Vec<PathBuf>,
    pub manifest: PathBuf,
}

/// Write a closed session to `output_dir`, consuming it
pub fn persist(
    session: RecordingSession,
    failures: &[ErrorRecord],
    output_dir: &Path,
) -> Result<Persisted> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let session_id = session.id();
    let opened_at = session.opened_at();
    let max_start_skew_secs = session.max_start_skew().as_secs_f64();

    let mut files = Vec::new();
    let mut devices = Vec::new();
    for recording in session.into_devices() {
        let file = match recording.samples() {
            Some(buffer) => {
                let name = recording_file_name(&recording.label, recording.started.wall);
                let path = output_dir.join(&name);
                let out = File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                write_samples_csv(out, buffer)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(
                    device = %recording.device,
                    samples = buffer.len(),
                    path = %path.display(),
                    "Wrote recording"
                );
                files.push(path);
                Some(name)
            }
            None => None,
        };

        devices.push(DeviceEntry {
            id: recording.device.to_string(),
            kind: recording.kind,
            label: recording.label.clone(),
            started_at: recording.started.wall,
            started_offset_secs: recording.started.monotonic.as_secs_f64(),
            stopped_at: recording.stopped.map(|t| t.wall),
            stopped_offset_secs: recording.stopped.map(|t| t.monotonic.as_secs_f64()),
            acknowledged: recording.acknowledged(),
            samples: recording.samples().map(SampleBuffer::len),
            file,
        });
    }

    let manifest = SessionManifest {
        session_id,
        opened_at,
        max_start_skew_secs,
        devices,
        failures: failures.iter().map(FailureEntry::from).collect(),
    };
    let manifest_path = output_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(&manifest_path, json)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), "Wrote session manifest");

    Ok(Persisted {
        files,
        manifest: manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tandem_core::{
        Capture, ClientFactory, DeviceAddress, DeviceClient, DeviceDescriptor, DeviceError,
        Locator, Orchestrator, OrchestratorConfig, SampleBatch, StopOutcome,
    };

    fn buffer() -> SampleBuffer {
        let batch = SampleBatch::new(
            vec![vec![1.0, -2.5], vec![0.48828125, 3.14159]],
            vec![0.0, 0.00390625],
        )
        .unwrap();
        SampleBuffer::from_batches(vec!["TP9".into(), "Right AUX".into()], vec![batch]).unwrap()
    }

    #[test]
    fn test_file_name_uses_label_and_wall_clock() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(
            recording_file_name("muse", at),
            "recording_muse_2024-03-07-14.05.09.csv"
        );
    }

    #[test]
    fn test_csv_layout() {
        let mut out = Vec::new();
        write_samples_csv(&mut out, &buffer()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ",TP9,Right AUX,timestamps");
        assert_eq!(lines[1], "0,1.000,0.488,0.000");
        assert_eq!(lines[2], "1,-2.500,3.142,0.004");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_persist_empty_session_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let persisted = persist(RecordingSession::new(), &[], &out).unwrap();

        assert!(persisted.files.is_empty());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&persisted.manifest).unwrap()).unwrap();
        assert_eq!(manifest["devices"], serde_json::json!([]));
        assert_eq!(manifest["max_start_skew_secs"], serde_json::json!(0.0));
    }

    struct Headset;

    #[async_trait::async_trait]
    impl DeviceClient for Headset {
        fn kind(&self) -> DeviceKind {
            DeviceKind::BleBiosignal
        }
        async fn discover(&mut self, _: &Locator) -> Result<DeviceAddress, DeviceError> {
            Ok(DeviceAddress::Ble {
                name: "Muse-1".into(),
                address: "00:11".into(),
            })
        }
        async fn connect(&mut self, _: &DeviceAddress) -> Result<(), DeviceError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn start_recording(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
            Ok(Capture::Samples(buffer()))
        }
        async fn disconnect(&mut self) {}
    }

    struct Camera;

    #[async_trait::async_trait]
    impl DeviceClient for Camera {
        fn kind(&self) -> DeviceKind {
            DeviceKind::UdpCamera
        }
        async fn discover(&mut self, _: &Locator) -> Result<DeviceAddress, DeviceError> {
            Ok(DeviceAddress::Url("udp".into()))
        }
        async fn connect(&mut self, _: &DeviceAddress) -> Result<(), DeviceError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn start_recording(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn stop_recording(&mut self) -> Result<Capture, DeviceError> {
            Ok(Capture::Acknowledged)
        }
        async fn disconnect(&mut self) {}
    }

    struct Factory;

    impl ClientFactory for Factory {
        fn create(&self, d: &DeviceDescriptor) -> Result<Box<dyn DeviceClient>, DeviceError> {
            match d.kind() {
                DeviceKind::BleBiosignal => Ok(Box::new(Headset)),
                _ => Ok(Box::new(Camera)),
            }
        }
    }

    #[tokio::test]
    async fn test_persist_recorded_session() {
        let mut orch = Orchestrator::new(Arc::new(Factory), OrchestratorConfig::default());
        orch.connect_all(vec![
            DeviceDescriptor::new(
                "eeg",
                DeviceKind::BleBiosignal,
                Locator::BleName {
                    name: "Muse-1".into(),
                },
            )
            .with_label("muse"),
            DeviceDescriptor::new("cam", DeviceKind::UdpCamera, Locator::Upnp { camera_url: None }),
        ])
        .await;
        orch.start_all().await.unwrap();
        let StopOutcome { session, report } = orch.stop_all().await.unwrap();

        let failure = ErrorRecord::new(
            "phone".into(),
            Operation::Connect,
            DeviceError::ConnectionLost("reset".into()),
        );
        let dir = tempfile::tempdir().unwrap();
        let persisted = persist(session, &[failure], dir.path()).unwrap();
        assert!(report.is_success());

        assert_eq!(persisted.files.len(), 1);
        let csv_name = persisted.files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(csv_name.starts_with("recording_muse_"));
        let csv = std::fs::read_to_string(&persisted.files[0]).unwrap();
        assert!(csv.starts_with(",TP9,Right AUX,timestamps\n0,1.000,"));

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&persisted.manifest).unwrap()).unwrap();
        let devices = manifest["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        let cam = devices.iter().find(|d| d["id"] == "cam").unwrap();
        assert_eq!(cam["acknowledged"], true);
        assert_eq!(cam["samples"], serde_json::Value::Null);
        let eeg = devices.iter().find(|d| d["id"] == "eeg").unwrap();
        assert_eq!(eeg["samples"], 2);
        assert_eq!(eeg["kind"], "ble_biosignal");
        assert_eq!(manifest["failures"][0]["kind"], "connection_lost");
        assert_eq!(manifest["failures"][0]["operation"], "connect");
    }
}
