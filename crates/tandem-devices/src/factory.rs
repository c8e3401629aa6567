//! Resolves device descriptors to protocol clients

use std::time::Duration;
use tandem_core::{ClientFactory, DeviceClient, DeviceDescriptor, DeviceError, DeviceKind, Locator};
use tandem_discovery::SharedDiscoveryCache;
use tracing::debug;

use crate::biosignal::BiosignalClient;
use crate::companion::CompanionClient;
use crate::gatt_camera::{GattCameraClient, DEFAULT_RESPONSE_TIMEOUT};
use crate::jsonrpc_camera::JsonRpcCameraClient;
use crate::udp_camera::{UdpCameraClient, UdpCameraCommands};

/// Transport-level bounds handed to every client
#[derive(Debug, Clone)]
pub struct ClientTimeouts {
    /// BLE scan window
    pub scan: Duration,
    /// BLE and TCP connect
    pub connect: Duration,
    /// HTTP request
    pub http: Duration,
    /// UPnP search receive
    pub upnp: Duration,
    /// Wait for a BLE command response
    pub response: Duration,
    /// Age after which cached BLE scan results are rescanned
    pub cache_max_age: Duration,
    /// Best-effort requests sent while disconnecting; keep below the orchestrator's disconnect bound
    pub teardown: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            scan: Duration::from_secs(10),
            connect: Duration::from_secs(15),
            http: Duration::from_secs(10),
            upnp: Duration::from_secs(10),
            response: DEFAULT_RESPONSE_TIMEOUT,
            cache_max_age: Duration::from_secs(60),
            teardown: Duration::from_secs(4),
        }
    }
}

/// Builds one client per descriptor; all BLE clients share one scan cache
pub struct DefaultClientFactory {
    timeouts: ClientTimeouts,
    udp_commands: UdpCameraCommands,
    http: reqwest::Client,
    cache: SharedDiscoveryCache,
}

impl DefaultClientFactory {
    pub fn new(timeouts: ClientTimeouts) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.http)
            .build()
            .map_err(|e| DeviceError::Transport(format!("HTTP client: {}", e)))?;
        let cache = SharedDiscoveryCache::new(timeouts.cache_max_age, timeouts.scan);
        Ok(Self {
            timeouts,
            udp_commands: UdpCameraCommands::default(),
            http,
            cache,
        })
    }

    pub fn with_udp_commands(mut self, commands: UdpCameraCommands) -> Self {
        self.udp_commands = commands;
        self
    }

    /// The scan cache shared by this factory's BLE clients
    pub fn discovery_cache(&self) -> SharedDiscoveryCache {
        self.cache.clone()
    }

    fn check_locator(descriptor: &DeviceDescriptor) -> Result<(), DeviceError> {
        let fits = matches!(
            (descriptor.kind(), descriptor.locator()),
            (DeviceKind::JsonRpcCamera, Locator::Upnp { .. })
                | (DeviceKind::UdpCamera, Locator::Endpoint { .. })
                | (DeviceKind::TcpCompanion, Locator::Endpoint { .. })
                | (
                    DeviceKind::BleCamera | DeviceKind::BleBiosignal,
                    Locator::BleName { .. } | Locator::BlePattern { .. }
                )
        );
        if fits {
            Ok(())
        } else {
            Err(DeviceError::UnsupportedOperation(format!(
                "{} cannot be located by {:?}",
                descriptor.kind(),
                descriptor.locator()
            )))
        }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn create(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceClient>, DeviceError> {
        Self::check_locator(descriptor)?;
        debug!(device = %descriptor.id(), kind = %descriptor.kind(), "Creating client");

        let t = &self.timeouts;
        let owner = descriptor.id().clone();
        let client: Box<dyn DeviceClient> = match descriptor.kind() {
            DeviceKind::JsonRpcCamera => {
                Box::new(
                    JsonRpcCameraClient::new(self.http.clone(), t.http, t.upnp)
                        .with_teardown_timeout(t.teardown),
                )
            }
            DeviceKind::UdpCamera => Box::new(UdpCameraClient::new(self.udp_commands.clone())),
            DeviceKind::BleCamera => Box::new(GattCameraClient::new(
                owner,
                self.cache.clone(),
                t.connect,
                t.response,
            )),
            DeviceKind::BleBiosignal => {
                Box::new(BiosignalClient::new(owner, self.cache.clone(), t.connect))
            }
            DeviceKind::TcpCompanion => Box::new(CompanionClient::new(t.connect)),
        };
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint() -> Locator {
        Locator::Endpoint {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5111,
        }
    }

    #[tokio::test]
    async fn test_each_kind_gets_its_client() {
        let factory = DefaultClientFactory::new(ClientTimeouts::default()).unwrap();
        let cases = [
            (DeviceKind::JsonRpcCamera, Locator::Upnp { camera_url: None }),
            (DeviceKind::UdpCamera, endpoint()),
            (
                DeviceKind::BleCamera,
                Locator::BlePattern {
                    pattern: "GoPro [A-Z0-9]{4}".into(),
                },
            ),
            (
                DeviceKind::BleBiosignal,
                Locator::BleName {
                    name: "Muse-1234".into(),
                },
            ),
            (DeviceKind::TcpCompanion, endpoint()),
        ];
        for (kind, locator) in cases {
            let client = factory
                .create(&DeviceDescriptor::new("dev", kind, locator))
                .unwrap();
            assert_eq!(client.kind(), kind);
            assert!(!client.is_connected());
        }
    }

    #[tokio::test]
    async fn test_mismatched_locator_is_unsupported() {
        let factory = DefaultClientFactory::new(ClientTimeouts::default()).unwrap();
        let result = factory.create(&DeviceDescriptor::new(
            "cam",
            DeviceKind::UdpCamera,
            Locator::BleName { name: "x".into() },
        ));
        assert!(matches!(result, Err(DeviceError::UnsupportedOperation(_))));
    }
}
