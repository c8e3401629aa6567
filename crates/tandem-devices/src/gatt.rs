//! BLE plumbing shared by the GATT camera and the biosignal headset

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use std::time::Duration;
use tandem_core::{DeviceAddress, DeviceError, DeviceId, Locator};
use tandem_discovery::{BleDevice, NameMatcher, SharedDiscoveryCache};
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) fn ble_error(err: btleplug::Error) -> DeviceError {
    match err {
        btleplug::Error::NotConnected => DeviceError::ConnectionLost("peripheral not connected".into()),
        btleplug::Error::TimedOut(limit) => DeviceError::ConnectionTimeout(limit),
        btleplug::Error::DeviceNotFound => DeviceError::DiscoveryFailed("peripheral vanished".into()),
        other => DeviceError::Transport(other.to_string()),
    }
}

pub(crate) fn matcher_for(locator: &Locator) -> Result<NameMatcher, DeviceError> {
    match locator {
        Locator::BleName { name } => Ok(NameMatcher::exact(name.clone())),
        Locator::BlePattern { pattern } => Ok(NameMatcher::pattern(pattern)?),
        other => Err(DeviceError::UnsupportedOperation(format!(
            "BLE device is located by name, got {:?}",
            other
        ))),
    }
}

/// Resolve a name locator through the shared scan cache
pub(crate) async fn discover(
    cache: &SharedDiscoveryCache,
    owner: &DeviceId,
    locator: &Locator,
) -> Result<(BleDevice, DeviceAddress), DeviceError> {
    let matcher = matcher_for(locator)?;
    let device = cache.claim_or_scan(owner, &matcher).await?;
    let address = DeviceAddress::Ble {
        name: device.name.clone(),
        address: device.address.clone(),
    };
    Ok((device, address))
}

/// The peripheral found by `discover`, if it is the one `address` names
pub(crate) fn peripheral_for(
    found: Option<&BleDevice>,
    address: &DeviceAddress,
) -> Result<Peripheral, DeviceError> {
    match (found, address) {
        (Some(device), DeviceAddress::Ble { address, .. }) if &device.address == address => {
            Ok(device.peripheral.clone())
        }
        (_, DeviceAddress::Ble { .. }) => Err(DeviceError::InvalidState(
            "peripheral was not discovered by this client".into(),
        )),
        (_, other) => Err(DeviceError::InvalidState(format!(
            "BLE client cannot connect to {}",
            other
        ))),
    }
}

/// The part of a peripheral that brings a GATT link up and down
#[async_trait]
pub(crate) trait GattLink: Send + Sync {
    async fn link_is_up(&self) -> Result<bool, DeviceError>;
    async fn open(&self) -> Result<(), DeviceError>;
    async fn resolve_services(&self) -> Result<(), DeviceError>;
    async fn close(&self) -> Result<(), DeviceError>;
    fn has_characteristic(&self, uuid: Uuid) -> bool;
}

#[async_trait]
impl GattLink for Peripheral {
    async fn link_is_up(&self) -> Result<bool, DeviceError> {
        self.is_connected().await.map_err(ble_error)
    }

    async fn open(&self) -> Result<(), DeviceError> {
        self.connect().await.map_err(ble_error)
    }

    async fn resolve_services(&self) -> Result<(), DeviceError> {
        self.discover_services().await.map_err(ble_error)
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.disconnect().await.map_err(ble_error)
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        find_characteristic(self, uuid).is_some()
    }
}

/// Connect within `limit`, resolve the GATT table and check `required`
///
/// btleplug exposes no explicit pairing step; platforms that need bonding do
/// it as part of the connection, so a successful connect is sufficient. Any
/// failure closes the link again, so a half-open connection never outlives
/// the call.
pub(crate) async fn connect<L: GattLink + ?Sized>(
    link: &L,
    limit: Duration,
    required: &[Uuid],
) -> Result<(), DeviceError> {
    let result = establish(link, limit, required).await;
    if result.is_err() {
        release(link).await;
    }
    result
}

async fn establish<L: GattLink + ?Sized>(
    link: &L,
    limit: Duration,
    required: &[Uuid],
) -> Result<(), DeviceError> {
    if !link.link_is_up().await? {
        tokio::time::timeout(limit, link.open())
            .await
            .map_err(|_| DeviceError::ConnectionTimeout(limit))??;
    }
    debug!("Pairing handled by platform connect");
    tokio::time::timeout(limit, link.resolve_services())
        .await
        .map_err(|_| DeviceError::ConnectionTimeout(limit))??;

    if let Some(missing) = required.iter().find(|uuid| !link.has_characteristic(**uuid)) {
        return Err(DeviceError::ProtocolViolation(format!(
            "characteristic {} missing",
            missing
        )));
    }
    info!(required = required.len(), "GATT services resolved");
    Ok(())
}

pub(crate) fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

pub(crate) async fn release<L: GattLink + ?Sized>(link: &L) {
    if let Err(e) = link.close().await {
        debug!(error = %e, "BLE disconnect failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locators_map_to_matchers() {
        let exact = matcher_for(&Locator::BleName {
            name: "Muse-0A1B".into(),
        })
        .unwrap();
        assert!(exact.matches("Muse-0A1B"));

        let pattern = matcher_for(&Locator::BlePattern {
            pattern: "GoPro [A-Z0-9]{4}".into(),
        })
        .unwrap();
        assert!(pattern.matches("GoPro 9XYZ"));

        assert!(matches!(
            matcher_for(&Locator::Upnp { camera_url: None }),
            Err(DeviceError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            matcher_for(&Locator::BlePattern { pattern: "(".into() }),
            Err(DeviceError::DiscoveryFailed(_))
        ));
    }

    #[test]
    fn test_ble_error_mapping() {
        assert!(matches!(
            ble_error(btleplug::Error::NotConnected),
            DeviceError::ConnectionLost(_)
        ));
        assert_eq!(
            ble_error(btleplug::Error::TimedOut(Duration::from_secs(15))),
            DeviceError::ConnectionTimeout(Duration::from_secs(15))
        );
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLink {
        services_hang: bool,
        characteristics: Vec<Uuid>,
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl GattLink for FakeLink {
        async fn link_is_up(&self) -> Result<bool, DeviceError> {
            Ok(self.opens.load(Ordering::SeqCst) > self.closes.load(Ordering::SeqCst))
        }

        async fn open(&self) -> Result<(), DeviceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resolve_services(&self) -> Result<(), DeviceError> {
            if self.services_hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), DeviceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn has_characteristic(&self, uuid: Uuid) -> bool {
            self.characteristics.contains(&uuid)
        }
    }

    const COMMAND: Uuid = Uuid::from_u128(0x72);

    #[tokio::test]
    async fn test_connect_keeps_a_complete_link() {
        let link = FakeLink {
            characteristics: vec![COMMAND],
            ..FakeLink::default()
        };
        connect(&link, Duration::from_secs(15), &[COMMAND]).await.unwrap();
        assert_eq!(link.opens.load(Ordering::SeqCst), 1);
        assert_eq!(link.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_characteristic_closes_link() {
        let link = FakeLink::default();
        let err = connect(&link, Duration::from_secs(15), &[COMMAND])
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolViolation(_)));
        assert_eq!(link.opens.load(Ordering::SeqCst), 1);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_discovery_timeout_closes_link() {
        let link = FakeLink {
            services_hang: true,
            characteristics: vec![COMMAND],
            ..FakeLink::default()
        };
        let err = connect(&link, Duration::from_secs(15), &[COMMAND])
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::ConnectionTimeout(Duration::from_secs(15)));
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }
}
