mod btleplug_backend;
mod driver;
pub(crate) mod endpoints;
pub(crate) mod fake_backend;
mod hardware;
mod model;
mod transport;

pub use self::driver::{ChannelEntity, FanEvent, FanSession, SessionSummary};
pub use self::endpoints::{ResolvedEndpoints, resolve_endpoints};
pub use self::fake_backend::{
    FakeAppliance, FakeApplianceHandle, FakeHardwareClient, Notifications,
};
pub use self::hardware::{
    BleLink, HardwareClient, LinkEvent, fake_hardware_client, real_hardware_client,
};
pub use self::model::{CharacteristicInfo, DeviceTarget, FoundDevice, ServiceInfo};
pub use self::transport::{BleClient, BleClientNode, FanEntity, OutboundOp, Outbox};
