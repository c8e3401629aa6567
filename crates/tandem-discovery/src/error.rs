//! Discovery error type

use tandem_core::DeviceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No device answered: {0}")]
    NotFound(String),
    #[error("No Bluetooth adapter available")]
    NoAdapter,
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to fetch device description: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid device description: {0}")]
    InvalidDescription(String),
    #[error("Invalid name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl From<DiscoveryError> for DeviceError {
    fn from(err: DiscoveryError) -> Self {
        DeviceError::DiscoveryFailed(err.to_string())
    }
}
