use std::time::Instant;

use crate::fan::{FanCommand, FanState};
use crate::handlers::CommandError;
use crate::protocol::EndpointId;
use crate::session::ConnectionState;

/// BLE operations the controller asks its transport to perform.
///
/// Calls never block; a binding queues them and reports the outcome back
/// through [`BleClientNode`] events.
pub trait BleClient {
    /// Writes raw bytes to a characteristic.
    fn write(&mut self, endpoint: EndpointId, bytes: Vec<u8>);

    /// Enables notifications on a characteristic.
    fn subscribe(&mut self, endpoint: EndpointId);

    /// Drops the link. The binding reports `on_disconnected` once it is gone.
    fn disconnect(&mut self);
}

/// The fan entity exposed to UI or automation collaborators.
pub trait FanEntity {
    /// Publishes a new fan state.
    fn set_state(&mut self, state: &FanState);

    /// Reports a command that could not be applied.
    fn write_failed(&mut self, command: &FanCommand, error: &CommandError);

    /// Reports a command the appliance acknowledged.
    fn write_succeeded(&mut self, _command: &FanCommand) {}

    /// Reports a connection state change.
    fn connection_changed(&mut self, _state: ConnectionState) {}
}

/// Events a BLE binding delivers to the controller.
pub trait BleClientNode {
    fn on_connected(&mut self, now: Instant);

    /// Service and characteristic discovery completed.
    fn on_services_resolved(&mut self, now: Instant);

    fn on_disconnected(&mut self, now: Instant);

    /// One notification arrived on `endpoint`.
    fn on_notification(&mut self, endpoint: EndpointId, bytes: &[u8], now: Instant);
}

/// One buffered BLE operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutboundOp {
    Write { endpoint: EndpointId, bytes: Vec<u8> },
    Subscribe(EndpointId),
    Disconnect,
}

/// [`BleClient`] that records operations for an async binding to flush.
#[derive(Debug, Default)]
pub struct Outbox {
    ops: Vec<OutboundOp>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations recorded since the last drain.
    #[must_use]
    pub fn ops(&self) -> &[OutboundOp] {
        &self.ops
    }

    /// Takes every recorded operation in order.
    pub fn drain(&mut self) -> Vec<OutboundOp> {
        std::mem::take(&mut self.ops)
    }

    /// Takes only the recorded writes, discarding other operations.
    pub fn drain_writes(&mut self) -> Vec<(EndpointId, Vec<u8>)> {
        self.drain()
            .into_iter()
            .filter_map(|op| match op {
                OutboundOp::Write { endpoint, bytes } => Some((endpoint, bytes)),
                OutboundOp::Subscribe(_) | OutboundOp::Disconnect => None,
            })
            .collect()
    }
}

impl BleClient for Outbox {
    fn write(&mut self, endpoint: EndpointId, bytes: Vec<u8>) {
        self.ops.push(OutboundOp::Write { endpoint, bytes });
    }

    fn subscribe(&mut self, endpoint: EndpointId) {
        self.ops.push(OutboundOp::Subscribe(endpoint));
    }

    fn disconnect(&mut self) {
        self.ops.push(OutboundOp::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn outbox_preserves_operation_order() {
        let mut outbox = Outbox::new();
        outbox.subscribe(EndpointId::AuthCharacteristic);
        outbox.write(EndpointId::AuthCharacteristic, vec![1, 2]);
        outbox.disconnect();

        assert_eq!(
            vec![
                OutboundOp::Subscribe(EndpointId::AuthCharacteristic),
                OutboundOp::Write {
                    endpoint: EndpointId::AuthCharacteristic,
                    bytes: vec![1, 2],
                },
                OutboundOp::Disconnect,
            ],
            outbox.drain()
        );
        assert!(outbox.ops().is_empty());
    }

    #[test]
    fn drain_writes_skips_other_operations() {
        let mut outbox = Outbox::new();
        outbox.subscribe(EndpointId::StateCharacteristic);
        outbox.write(EndpointId::StateCharacteristic, vec![9]);

        assert_eq!(
            vec![(EndpointId::StateCharacteristic, vec![9])],
            outbox.drain_writes()
        );
    }
}
