use std::fmt;

use async_trait::async_trait;
use tracing::info;

use super::btleplug_backend::BtleplugHardwareClient;
use super::fake_backend::{FakeAppliance, FakeHardwareClient};
use super::model::{DeviceTarget, FoundDevice, ServiceInfo};
use crate::error::InteractionError;
use crate::protocol::EndpointId;

/// Something that happened on an open link.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    /// A characteristic notified.
    Notification { endpoint: EndpointId, bytes: Vec<u8> },
    /// The peripheral dropped the connection.
    Disconnected,
}

/// One connected appliance.
#[async_trait]
pub trait BleLink: Send + fmt::Debug {
    fn device(&self) -> &FoundDevice;

    /// Services discovered after connecting.
    fn services(&self) -> &[ServiceInfo];

    async fn subscribe(&mut self, endpoint: EndpointId) -> Result<(), InteractionError>;

    async fn write(&mut self, endpoint: EndpointId, bytes: &[u8]) -> Result<(), InteractionError>;

    /// Waits for the next link event.
    ///
    /// Returns [`LinkEvent::Disconnected`] forever once the link is gone.
    async fn next_event(&mut self) -> LinkEvent;

    /// Disconnects and releases the link.
    async fn close(self: Box<Self>) -> Result<(), InteractionError>;
}

/// Finds and connects appliances.
#[async_trait]
pub trait HardwareClient: Send + Sync {
    /// Scans for `target`, connects and discovers its services.
    async fn connect(&self, target: &DeviceTarget) -> Result<Box<dyn BleLink>, InteractionError>;
}

/// Builds a hardware client backed by the host BLE stack.
#[must_use]
pub fn real_hardware_client() -> Box<dyn HardwareClient> {
    Box::new(BtleplugHardwareClient::new())
}

/// Builds a hardware client that talks to an in-process appliance.
#[must_use]
pub fn fake_hardware_client(appliance: FakeAppliance) -> Box<dyn HardwareClient> {
    info!("using fake BLE backend");
    Box::new(FakeHardwareClient::new(appliance))
}
