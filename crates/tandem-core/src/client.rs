//! The capability contract every protocol client implements

use async_trait::async_trait;

use crate::device::{DeviceAddress, DeviceDescriptor, DeviceKind, Locator};
use crate::error::DeviceError;
use crate::session::Capture;

/// Uniform interface over one device of any family
///
/// A client instance belongs to exactly one registered device. Implementations
/// must bound every wait with an explicit timeout.
#[async_trait]
pub trait DeviceClient: Send {
    fn kind(&self) -> DeviceKind;

    /// Resolve a locator hint into a connectable address
    async fn discover(&mut self, locator: &Locator) -> Result<DeviceAddress, DeviceError>;

    /// Establish the transport. A second call on a connected client is a no-op.
    async fn connect(&mut self, address: &DeviceAddress) -> Result<(), DeviceError>;

    fn is_connected(&self) -> bool;

    /// Issue the start command and return once the device acknowledged it
    async fn start_recording(&mut self) -> Result<(), DeviceError>;

    /// Issue the stop command; streaming devices hand over their samples
    async fn stop_recording(&mut self) -> Result<Capture, DeviceError>;

    /// Release transport resources. Idempotent and best-effort.
    async fn disconnect(&mut self);
}

/// Resolves a descriptor to a fresh client of the matching family
pub trait ClientFactory: Send + Sync {
    fn create(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceClient>, DeviceError>;
}
