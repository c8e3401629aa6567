//! Tandem Discovery - finding recording devices before connecting
//!
//! Discovery methods:
//! - UPnP/SSDP `M-SEARCH` for cameras with a JSON-RPC remote control API
//! - Timed BLE scans filtered by advertised name
//! - A shared cache of BLE scan results with one-to-one claims

pub mod ble;
pub mod cache;
pub mod error;
pub mod ssdp;

pub use ble::{BleDevice, NameMatcher};
pub use cache::{DiscoveryCache, SharedDiscoveryCache};
pub use error::DiscoveryError;
