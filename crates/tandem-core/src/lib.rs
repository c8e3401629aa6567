//! Tandem Core - Device contract, recording sessions, and the orchestrator
//!
//! This crate provides the foundational pieces of a synchronized
//! multi-device recording:
//! - Device descriptors, locators, and connection states
//! - The error taxonomy shared by all protocol clients
//! - The `DeviceClient` capability contract
//! - Recording sessions with per-device host timestamps and sample buffers
//! - The orchestrator that fans connect/start/stop out to every device

pub mod client;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod session;

pub use client::{ClientFactory, DeviceClient};
pub use device::{ConnectionState, DeviceAddress, DeviceDescriptor, DeviceId, DeviceKind, Locator};
pub use error::{
    CameraErrorCode, DeviceError, ErrorKind, ErrorRecord, Operation, OrchestratorError,
    ProtocolError,
};
pub use orchestrator::{
    ConnectionHandle, FanOutReport, Orchestrator, OrchestratorConfig, StopOutcome,
};
pub use session::{
    Capture, DeviceRecording, RecordingSession, SampleBatch, SampleBuffer, Timestamp,
};
