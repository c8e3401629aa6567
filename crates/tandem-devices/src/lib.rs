//! Tandem Devices - protocol clients for every supported device family
//!
//! Each client implements `tandem_core::DeviceClient`:
//! - `jsonrpc_camera`: Wi-Fi camera with a JSON-RPC remote control API
//! - `udp_camera`: fire-and-forget UDP camera control
//! - `gatt_camera`: action camera shutter over BLE GATT
//! - `biosignal`: EEG headset streaming over BLE notifications
//! - `companion`: companion phone over TCP

pub mod biosignal;
pub mod companion;
pub mod factory;
mod gatt;
pub mod gatt_camera;
pub mod jsonrpc_camera;
pub mod transport;
pub mod udp_camera;

pub use biosignal::BiosignalClient;
pub use companion::CompanionClient;
pub use factory::{ClientTimeouts, DefaultClientFactory};
pub use gatt_camera::GattCameraClient;
pub use jsonrpc_camera::JsonRpcCameraClient;
pub use udp_camera::{UdpCameraClient, UdpCameraCommands, DEFAULT_UDP_CAMERA_PORT};
