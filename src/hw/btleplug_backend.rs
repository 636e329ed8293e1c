use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, instrument, trace};

use super::endpoints::{ResolvedEndpoints, resolve_endpoints};
use super::hardware::{BleLink, HardwareClient, LinkEvent};
use super::model::{CharacteristicInfo, DeviceTarget, FoundDevice, ServiceInfo};
use crate::error::InteractionError;
use crate::protocol::EndpointId;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type CentralEventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Hardware client backed by the host BLE stack.
#[derive(Debug, Default)]
pub(crate) struct BtleplugHardwareClient;

impl BtleplugHardwareClient {
    pub(crate) fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HardwareClient for BtleplugHardwareClient {
    #[instrument(skip(self), level = "info", fields(%target))]
    async fn connect(&self, target: &DeviceTarget) -> Result<Box<dyn BleLink>, InteractionError> {
        let manager = Manager::new().await?;
        let adapters = adapters(&manager).await?;
        let found = find_matching(&adapters, target).await?;

        if !found.peripheral.is_connected().await? {
            found.peripheral.connect().await?;
        }
        found.peripheral.discover_services().await?;

        let (services, characteristics_by_uuid) =
            collect_services_and_characteristics(&found.peripheral);
        let endpoints = match resolve_endpoints(&services) {
            Ok(endpoints) => endpoints,
            Err(error) => {
                if let Err(disconnect_error) = found.peripheral.disconnect().await {
                    debug!(
                        ?disconnect_error,
                        "failed to disconnect after endpoint validation error"
                    );
                }
                return Err(error);
            }
        };
        let characteristics = characteristics_by_endpoint(&endpoints, &characteristics_by_uuid)?;
        let notifications = found.peripheral.notifications().await?;
        let central_events = found.adapter.events().await?;

        info!(device_id = found.device.device_id(), "connected to Boneco appliance");
        Ok(Box::new(BtleplugLink {
            device: found.device,
            services,
            endpoints,
            characteristics,
            peripheral: found.peripheral,
            notifications,
            central_events,
            closed: false,
        }))
    }
}

#[instrument(skip(manager), level = "trace")]
async fn adapters(manager: &Manager) -> Result<Vec<AdapterHandle>, InteractionError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(InteractionError::NoAdapters);
    }

    let mut handles = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let name = adapter.adapter_info().await?;
        handles.push(AdapterHandle { adapter, name });
    }
    Ok(handles)
}

/// Scans until a peripheral matching `target` appears.
#[instrument(skip(adapters), level = "debug", fields(%target))]
async fn find_matching(
    adapters: &[AdapterHandle],
    target: &DeviceTarget,
) -> Result<FoundPeripheral, InteractionError> {
    info!(adapter_count = adapters.len(), "starting BLE scan");
    for handle in adapters {
        handle.adapter.start_scan(ScanFilter::default()).await?;
    }

    loop {
        for handle in adapters {
            for peripheral in handle.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let device = FoundDevice::new(
                    handle.name.clone(),
                    properties.address.to_string(),
                    properties.local_name,
                    properties.rssi,
                );
                if !device.matches(target) {
                    trace!(device_id = device.device_id(), "skipping non-matching peripheral");
                    continue;
                }

                for other in adapters {
                    if let Err(error) = other.adapter.stop_scan().await {
                        debug!(?error, "failed to stop adapter scan cleanly");
                    }
                }
                return Ok(FoundPeripheral {
                    adapter: handle.adapter.clone(),
                    peripheral,
                    device,
                });
            }
        }

        sleep(SCAN_POLL_INTERVAL).await;
    }
}

struct BtleplugLink {
    device: FoundDevice,
    services: Vec<ServiceInfo>,
    endpoints: ResolvedEndpoints,
    characteristics: HashMap<EndpointId, Characteristic>,
    peripheral: Peripheral,
    notifications: NotificationStream,
    central_events: CentralEventStream,
    closed: bool,
}

impl fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("device", &self.device)
            .field("endpoints", &self.endpoints)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl BtleplugLink {
    fn characteristic_for(&self, endpoint: EndpointId) -> Result<&Characteristic, InteractionError> {
        self.characteristics
            .get(&endpoint)
            .ok_or(InteractionError::MissingEndpoint { endpoint })
    }

    fn mark_closed(&mut self) -> LinkEvent {
        self.closed = true;
        LinkEvent::Disconnected
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn device(&self) -> &FoundDevice {
        &self.device
    }

    fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    #[instrument(skip(self), level = "trace", fields(%endpoint))]
    async fn subscribe(&mut self, endpoint: EndpointId) -> Result<(), InteractionError> {
        let characteristic = self.characteristic_for(endpoint)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    #[instrument(skip(self, bytes), level = "trace", fields(%endpoint, len = bytes.len()))]
    async fn write(&mut self, endpoint: EndpointId, bytes: &[u8]) -> Result<(), InteractionError> {
        if self.closed {
            return Err(InteractionError::LinkClosed);
        }
        let characteristic = self.characteristic_for(endpoint)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, bytes, write_type)
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            if self.closed {
                return LinkEvent::Disconnected;
            }
            tokio::select! {
                notification = self.notifications.next() => {
                    let Some(notification) = notification else {
                        return self.mark_closed();
                    };
                    match self.endpoints.endpoint_for(&notification.uuid.to_string()) {
                        Some(endpoint) => {
                            return LinkEvent::Notification {
                                endpoint,
                                bytes: notification.value,
                            };
                        }
                        None => trace!(uuid = %notification.uuid, "ignoring notification from unknown characteristic"),
                    }
                }
                event = self.central_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == self.peripheral.id() => {
                        info!("appliance disconnected");
                        return self.mark_closed();
                    }
                    Some(_other) => {}
                    None => return self.mark_closed(),
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(self: Box<Self>) -> Result<(), InteractionError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

#[derive(Debug)]
struct FoundPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    device: FoundDevice,
}

fn collect_services_and_characteristics(
    peripheral: &Peripheral,
) -> (Vec<ServiceInfo>, HashMap<String, Characteristic>) {
    let mut services = Vec::new();
    let mut characteristics_by_uuid = HashMap::new();

    for service in peripheral.services() {
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            let characteristic_uuid = characteristic.uuid.to_string().to_lowercase();
            characteristics_by_uuid
                .entry(characteristic_uuid.clone())
                .or_insert_with(|| characteristic.clone());
            characteristics.push(CharacteristicInfo::new(
                characteristic_uuid,
                property_labels(characteristic.properties),
            ));
        }
        characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));

        services.push(ServiceInfo::new(
            service.uuid.to_string().to_lowercase(),
            service.primary,
            characteristics,
        ));
    }
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));

    (services, characteristics_by_uuid)
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}

fn characteristics_by_endpoint(
    endpoints: &ResolvedEndpoints,
    characteristics_by_uuid: &HashMap<String, Characteristic>,
) -> Result<HashMap<EndpointId, Characteristic>, InteractionError> {
    [EndpointId::AuthCharacteristic, EndpointId::StateCharacteristic]
        .into_iter()
        .map(|endpoint| {
            endpoints
                .uuid(endpoint)
                .and_then(|uuid| characteristics_by_uuid.get(uuid))
                .cloned()
                .map(|characteristic| (endpoint, characteristic))
                .ok_or(InteractionError::MissingEndpoint { endpoint })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn property_labels_are_lowercase_flag_names() {
        assert_eq!(
            vec!["write".to_string(), "notify".to_string()],
            property_labels(CharPropFlags::WRITE | CharPropFlags::NOTIFY)
        );
        assert_eq!(vec!["none".to_string()], property_labels(CharPropFlags::empty()));
    }
}
