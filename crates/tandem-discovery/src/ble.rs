//! Timed BLE scanning filtered by advertised name

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;

/// Default scan window
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Advertised-name filter
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Exact(String),
    /// Anchored regular expression over the whole name
    Pattern(Regex),
}

impl NameMatcher {
    pub fn exact(name: impl Into<String>) -> Self {
        Self::Exact(name.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, DiscoveryError> {
        Ok(Self::Pattern(Regex::new(&format!("^(?:{})$", pattern))?))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == name,
            Self::Pattern(re) => re.is_match(name),
        }
    }
}

impl std::fmt::Display for NameMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "'{}'", name),
            Self::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// An advertising device seen during a scan
#[derive(Debug, Clone)]
pub struct BleDevice<P = Peripheral> {
    pub name: String,
    /// Platform address (MAC, or an opaque id where the OS hides it)
    pub address: String,
    pub peripheral: P,
}

/// Open the first Bluetooth adapter of the host
pub async fn default_adapter() -> Result<Adapter, DiscoveryError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(DiscoveryError::NoAdapter)
}

/// Actively scan for `duration` and return every device advertising a name
///
/// Results are sorted by name, then address, so repeated scans hand out
/// identical models in a stable order.
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<BleDevice>, DiscoveryError> {
    info!(duration_secs = duration.as_secs_f64(), "Starting BLE scan");
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;
    if let Err(e) = adapter.stop_scan().await {
        warn!(error = %e, "Failed to stop BLE scan");
    }

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "Skipping peripheral without properties");
                continue;
            }
        };
        if let Some(name) = properties.local_name {
            devices.push(BleDevice {
                name,
                address: properties.address.to_string(),
                peripheral,
            });
        }
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
    info!(found = devices.len(), "BLE scan complete");
    Ok(devices)
}

/// Keep only devices whose name satisfies `matcher`
pub fn filter_by_name<P>(devices: Vec<BleDevice<P>>, matcher: &NameMatcher) -> Vec<BleDevice<P>> {
    devices
        .into_iter()
        .filter(|d| matcher.matches(&d.name))
        .collect()
}
