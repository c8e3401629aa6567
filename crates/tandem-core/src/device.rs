//! Device types for describing and addressing recording hardware

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Unique identifier for a configured device, chosen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device family, one per protocol client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Wi-Fi camera driven by JSON-RPC over HTTP (Sony-style)
    JsonRpcCamera,
    /// Wi-Fi camera driven by fire-and-forget UDP datagrams (Lumix-style)
    UdpCamera,
    /// BLE camera driven through a GATT command characteristic (GoPro-style)
    BleCamera,
    /// BLE headset streaming biosignal samples (EEG)
    BleBiosignal,
    /// Companion phone listening on a TCP socket
    TcpCompanion,
}

impl DeviceKind {
    /// Whether stopping this device yields sample buffers rather than an ack
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::BleBiosignal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonRpcCamera => "json_rpc_camera",
            Self::UdpCamera => "udp_camera",
            Self::BleCamera => "ble_camera",
            Self::BleBiosignal => "ble_biosignal",
            Self::TcpCompanion => "tcp_companion",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-supplied hint used to find a device before connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Locator {
    /// Fixed IP endpoint (UDP and TCP families, no discovery)
    Endpoint { ip: IpAddr, port: u16 },
    /// UPnP search, or a control URL that is already known
    Upnp { camera_url: Option<String> },
    /// BLE advertised name, matched exactly
    BleName { name: String },
    /// BLE advertised name, matched against a regular expression
    BlePattern { pattern: String },
}

/// Identifies a device before connection. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    id: DeviceId,
    kind: DeviceKind,
    locator: Locator,
    /// Name used in output artifacts; defaults to the id
    label: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, kind: DeviceKind, locator: Locator) -> Self {
        Self {
            id: id.into(),
            kind,
            locator,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Concrete, connectable address produced by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAddress {
    /// IP socket (UDP or TCP)
    Socket(SocketAddr),
    /// HTTP control endpoint
    Url(String),
    /// BLE peripheral, identified by its advertised name and MAC address
    Ble { name: String, address: String },
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Url(url) => write!(f, "{}", url),
            Self::Ble { name, address } => write!(f, "{} ({})", name, address),
        }
    }
}

/// Transport state of a registered device
///
/// `Disconnected -> Connecting -> Connected -> Recording -> Connected -> Disconnected`,
/// with `Error` reachable from any transitional state. `Error` is left only
/// through an explicit reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recording,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}
