//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::{DeviceDescriptor, DeviceKind, Locator, OrchestratorConfig};
use tandem_devices::gatt_camera::NAME_PATTERN;
use tandem_devices::{ClientTimeouts, UdpCameraCommands, DEFAULT_UDP_CAMERA_PORT};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("device '{device}': missing '{field}' for {kind}")]
    MissingField {
        device: String,
        kind: DeviceKind,
        field: &'static str,
    },
    #[error("device '{device}': cannot resolve host '{host}'")]
    UnresolvedHost { device: String, host: String },
    #[error("device id '{0}' is used more than once")]
    DuplicateId(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub udp_camera: UdpCameraCommands,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory receiving CSV files and the session manifest
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Recording length; without it `record` runs until Ctrl-C
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            duration_secs: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./recordings")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// BLE scan window
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// BLE and TCP connect
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Per HTTP request
    #[serde(default = "default_http_secs")]
    pub http_secs: u64,
    /// UPnP search receive
    #[serde(default = "default_upnp_secs")]
    pub upnp_secs: u64,
    /// Upper bound for each per-device step
    #[serde(default = "default_operation_secs")]
    pub operation_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            connect_secs: default_connect_secs(),
            http_secs: default_http_secs(),
            upnp_secs: default_upnp_secs(),
            operation_secs: default_operation_secs(),
        }
    }
}

fn default_scan_secs() -> u64 {
    10
}

fn default_connect_secs() -> u64 {
    15
}

fn default_http_secs() -> u64 {
    10
}

fn default_upnp_secs() -> u64 {
    10
}

fn default_operation_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device id
    pub id: String,
    pub kind: DeviceKind,
    /// Name used in output files (defaults to the id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Exact BLE advertised name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// BLE advertised name regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    /// Known camera control URL (skips UPnP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_url: Option<String>,
}

impl DeviceConfig {
    fn missing(&self, field: &'static str) -> ConfigError {
        ConfigError::MissingField {
            device: self.id.clone(),
            kind: self.kind,
            field,
        }
    }

    fn ip(&self) -> Result<IpAddr, ConfigError> {
        if let Some(ip) = self.ip {
            return Ok(ip);
        }
        let host = self.host.as_deref().ok_or_else(|| self.missing("ip"))?;
        (host, 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| ConfigError::UnresolvedHost {
                device: self.id.clone(),
                host: host.to_string(),
            })
    }

    fn ble_locator(&self, default_pattern: Option<&str>) -> Result<Locator, ConfigError> {
        if let Some(name) = &self.name {
            return Ok(Locator::BleName { name: name.clone() });
        }
        self.name_pattern
            .as_deref()
            .or(default_pattern)
            .map(|pattern| Locator::BlePattern {
                pattern: pattern.to_string(),
            })
            .ok_or_else(|| self.missing("name"))
    }

    pub fn to_descriptor(&self) -> Result<DeviceDescriptor, ConfigError> {
        let locator = match self.kind {
            DeviceKind::JsonRpcCamera => Locator::Upnp {
                camera_url: self.camera_url.clone(),
            },
            DeviceKind::UdpCamera => Locator::Endpoint {
                ip: self.ip()?,
                port: self.port.unwrap_or(DEFAULT_UDP_CAMERA_PORT),
            },
            DeviceKind::TcpCompanion => Locator::Endpoint {
                ip: self.ip()?,
                port: self.port.ok_or_else(|| self.missing("port"))?,
            },
            DeviceKind::BleCamera => self.ble_locator(Some(NAME_PATTERN))?,
            DeviceKind::BleBiosignal => self.ble_locator(None)?,
        };

        let descriptor = DeviceDescriptor::new(self.id.as_str(), self.kind, locator);
        Ok(match &self.label {
            Some(label) => descriptor.with_label(label.clone()),
            None => descriptor,
        })
    }
}

impl Config {
    /// Build descriptors for every configured device
    pub fn to_descriptors(&self) -> Result<Vec<DeviceDescriptor>, ConfigError> {
        let mut descriptors: Vec<DeviceDescriptor> = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            if descriptors.iter().any(|d| d.id().as_str() == device.id) {
                return Err(ConfigError::DuplicateId(device.id.clone()));
            }
            descriptors.push(device.to_descriptor()?);
        }
        Ok(descriptors)
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            operation_timeout: Duration::from_secs(self.timeouts.operation_secs),
            ..OrchestratorConfig::default()
        }
    }

    pub fn to_client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            scan: Duration::from_secs(self.timeouts.scan_secs),
            connect: Duration::from_secs(self.timeouts.connect_secs),
            http: Duration::from_secs(self.timeouts.http_secs),
            upnp: Duration::from_secs(self.timeouts.upnp_secs),
            ..ClientTimeouts::default()
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            path = %path.display(),
            devices = config.devices.len(),
            "Loaded configuration"
        );
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save an example configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let device = |id: &str, kind| DeviceConfig {
        id: id.to_string(),
        kind,
        label: None,
        ip: None,
        host: None,
        port: None,
        name: None,
        name_pattern: None,
        camera_url: None,
    };
    let config = Config {
        devices: vec![
            device("sony", DeviceKind::JsonRpcCamera),
            DeviceConfig {
                ip: Some(IpAddr::from([192, 168, 54, 1])),
                ..device("lumix", DeviceKind::UdpCamera)
            },
            DeviceConfig {
                name_pattern: Some(NAME_PATTERN.to_string()),
                ..device("gopro", DeviceKind::BleCamera)
            },
            DeviceConfig {
                name: Some("Muse-0000".to_string()),
                ..device("muse", DeviceKind::BleBiosignal)
            },
            DeviceConfig {
                ip: Some(IpAddr::from([192, 168, 1, 50])),
                port: Some(5000),
                label: Some("phone".to_string()),
                ..device("companion", DeviceKind::TcpCompanion)
            },
        ],
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[session]
output_dir = "/tmp/tandem"
duration_secs = 30

[timeouts]
scan_secs = 5
operation_secs = 20

[[device]]
id = "cam"
kind = "json_rpc_camera"

[[device]]
id = "lumix"
kind = "udp_camera"
ip = "192.168.54.1"

[[device]]
id = "gopro"
kind = "ble_camera"

[[device]]
id = "eeg"
kind = "ble_biosignal"
name = "Muse-ABCD"
label = "muse"

[[device]]
id = "phone"
kind = "tcp_companion"
host = "127.0.0.1"
port = 5000
"#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.session.duration_secs, Some(30));
        assert_eq!(config.timeouts.scan_secs, 5);
        assert_eq!(config.timeouts.connect_secs, 15);
        assert_eq!(config.devices.len(), 5);

        let descriptors = config.to_descriptors().unwrap();
        assert_eq!(descriptors[0].locator(), &Locator::Upnp { camera_url: None });
        assert_eq!(
            descriptors[1].locator(),
            &Locator::Endpoint {
                ip: IpAddr::from([192, 168, 54, 1]),
                port: DEFAULT_UDP_CAMERA_PORT
            }
        );
        assert_eq!(
            descriptors[2].locator(),
            &Locator::BlePattern {
                pattern: NAME_PATTERN.to_string()
            }
        );
        assert_eq!(descriptors[3].label(), "muse");
        assert_eq!(
            descriptors[4].locator(),
            &Locator::Endpoint {
                ip: IpAddr::from([127, 0, 0, 1]),
                port: 5000
            }
        );

        assert_eq!(
            config.to_orchestrator_config().operation_timeout,
            Duration::from_secs(20)
        );
        assert_eq!(config.to_client_timeouts().scan, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let config: Config = toml::from_str(
            r#"
[[device]]
id = "eeg"
kind = "ble_biosignal"
"#,
        )
        .unwrap();
        assert_eq!(
            config.to_descriptors(),
            Err(ConfigError::MissingField {
                device: "eeg".into(),
                kind: DeviceKind::BleBiosignal,
                field: "name"
            })
        );
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let config: Config = toml::from_str(
            r#"
[[device]]
id = "cam"
kind = "json_rpc_camera"

[[device]]
id = "cam"
kind = "json_rpc_camera"
"#,
        )
        .unwrap();
        assert_eq!(
            config.to_descriptors(),
            Err(ConfigError::DuplicateId("cam".into()))
        );
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.devices.len(), 5);
        assert!(config.to_descriptors().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.session.output_dir, PathBuf::from("./recordings"));
    }
}
