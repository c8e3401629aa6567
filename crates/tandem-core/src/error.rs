//! Error taxonomy shared by every protocol client and the orchestrator

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceId;

/// Error codes of the camera JSON-RPC remote control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraErrorCode {
    Any,
    Timeout,
    IllegalArgument,
    IllegalDataFormat,
    IllegalRequest,
    IllegalResponse,
    IllegalState,
    IllegalType,
    IndexOutOfBounds,
    NoSuchElement,
    NoSuchMethod,
    NoSuchField,
    NullPointer,
    UnsupportedVersion,
    UnsupportedOperation,
    ShootFail,
    CameraNotReady,
    PollingAlreadyRunning,
    CapturingNotFinished,
    ContentCannotDelete,
}

impl CameraErrorCode {
    /// Map a numeric API code; `None` for codes outside the published table
    pub fn from_code(code: i64) -> Option<Self> {
        let code = match code {
            1 => Self::Any,
            2 => Self::Timeout,
            3 => Self::IllegalArgument,
            4 => Self::IllegalDataFormat,
            5 => Self::IllegalRequest,
            6 => Self::IllegalResponse,
            7 => Self::IllegalState,
            8 => Self::IllegalType,
            9 => Self::IndexOutOfBounds,
            10 => Self::NoSuchElement,
            11 => Self::NoSuchMethod,
            12 => Self::NoSuchField,
            13 => Self::NullPointer,
            14 => Self::UnsupportedVersion,
            15 => Self::UnsupportedOperation,
            40400 => Self::ShootFail,
            40401 => Self::CameraNotReady,
            40402 => Self::PollingAlreadyRunning,
            40403 => Self::CapturingNotFinished,
            41003 => Self::ContentCannotDelete,
            _ => return None,
        };
        Some(code)
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Any => 1,
            Self::Timeout => 2,
            Self::IllegalArgument => 3,
            Self::IllegalDataFormat => 4,
            Self::IllegalRequest => 5,
            Self::IllegalResponse => 6,
            Self::IllegalState => 7,
            Self::IllegalType => 8,
            Self::IndexOutOfBounds => 9,
            Self::NoSuchElement => 10,
            Self::NoSuchMethod => 11,
            Self::NoSuchField => 12,
            Self::NullPointer => 13,
            Self::UnsupportedVersion => 14,
            Self::UnsupportedOperation => 15,
            Self::ShootFail => 40400,
            Self::CameraNotReady => 40401,
            Self::PollingAlreadyRunning => 40402,
            Self::CapturingNotFinished => 40403,
            Self::ContentCannotDelete => 41003,
        }
    }
}

impl std::fmt::Display for CameraErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A command the device understood but refused, in the device's own terms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("camera API error {0}")]
    Camera(CameraErrorCode),
    #[error("command {command:#04x} rejected with status {status}")]
    CommandRejected { command: u8, status: u8 },
}

/// Failure of a single device operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DiscoveryFailed(String),
    #[error("Timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Device rejected command: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
            Self::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transport(_) => ErrorKind::Transport,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::BrokenPipe
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::UnexpectedEof => Self::ConnectionLost(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

/// Coarse classification of a [`DeviceError`], for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DiscoveryFailed,
    ConnectionTimeout,
    ConnectionLost,
    Protocol,
    ProtocolViolation,
    UnsupportedOperation,
    Cancelled,
    Transport,
    InvalidState,
}

/// The step of a device's call chain an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Register,
    Discover,
    Connect,
    Start,
    Stop,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Register => "register",
            Self::Discover => "discover",
            Self::Connect => "connect",
            Self::Start => "start",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// A failed operation attributed to the device it happened on
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{device}: {operation} failed: {error}")]
pub struct ErrorRecord {
    pub device: DeviceId,
    pub operation: Operation,
    pub error: DeviceError,
}

impl ErrorRecord {
    pub fn new(device: DeviceId, operation: Operation, error: DeviceError) -> Self {
        Self {
            device,
            operation,
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Orchestrator-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Device already registered: {0}")]
    DuplicateDevice(DeviceId),
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("A recording session is already active")]
    SessionActive,
    #[error("No recording session is active")]
    NoActiveSession,
    #[error("No device is connected")]
    NoConnectedDevices,
    #[error("{} device(s) failed, {} succeeded", .failed.len(), .succeeded.len())]
    PartialFailure {
        succeeded: Vec<DeviceId>,
        failed: Vec<ErrorRecord>,
    },
    #[error("All {} device(s) failed", .0.len())]
    AllFailed(Vec<ErrorRecord>),
    #[error(transparent)]
    Device(#[from] ErrorRecord),
}
