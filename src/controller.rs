use std::time::Instant;

use tracing::{debug, error, instrument, warn};

use crate::config::FanConfig;
use crate::fan::{FanCommand, FanState};
use crate::handlers::{
    BonecoFrameCodec, CommandDispatcher, CommandError, DispatchEvent, Frame, FrameCodec,
    FrameCodecError, OutboundCommand, StateBlock,
};
use crate::hw::{BleClient, BleClientNode, FanEntity};
use crate::notification::NotificationTranslator;
use crate::protocol::{EndpointId, Opcode};
use crate::session::{ConnectionState, Session, SessionStep};

/// Drives one fan appliance.
///
/// The controller never blocks and never reads the clock. A binding delivers
/// BLE events through [`BleClientNode`], calls [`FanController::tick`]
/// periodically, and performs whatever the controller queued on its
/// [`BleClient`].
///
/// ```
/// use std::time::Instant;
/// use boneco::{ConnectionState, DeviceKey, FanConfig, FanController, Outbox};
///
/// # struct NoopEntity;
/// # impl boneco::FanEntity for NoopEntity {
/// #     fn set_state(&mut self, _state: &boneco::FanState) {}
/// #     fn write_failed(&mut self, _command: &boneco::FanCommand, _error: &boneco::CommandError) {}
/// # }
/// let config = FanConfig::builder()
///     .device_key(DeviceKey::parse("00112233445566778899aabbccddeeff")?)
///     .build();
/// let mut controller = FanController::new(config, Outbox::new(), NoopEntity);
/// assert_eq!(ConnectionState::Disconnected, controller.connection_state());
/// controller.tick(Instant::now());
/// # Ok::<(), boneco::InvalidKeyFormat>(())
/// ```
#[derive(Debug)]
pub struct FanController<C, E> {
    config: FanConfig,
    client: C,
    entity: E,
    codec: Box<dyn FrameCodec>,
    session: Session,
    dispatcher: CommandDispatcher,
    translator: NotificationTranslator,
    reported_state: ConnectionState,
}

impl<C, E> FanController<C, E>
where
    C: BleClient,
    E: FanEntity,
{
    /// Creates a disconnected controller using the default frame codec.
    #[must_use]
    pub fn new(config: FanConfig, client: C, entity: E) -> Self {
        let session = Session::new(
            config.device_key().clone(),
            config.handshake_timeout(),
            config.degraded_threshold(),
        );
        let dispatcher = CommandDispatcher::new(config.ack_timeout(), config.max_retries());
        Self {
            config,
            client,
            entity,
            codec: Box::new(BonecoFrameCodec),
            session,
            dispatcher,
            translator: NotificationTranslator::new(),
            reported_state: ConnectionState::Disconnected,
        }
    }

    /// Replaces the wire codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Box<dyn FrameCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Last published fan state.
    #[must_use]
    pub fn fan_state(&self) -> &FanState {
        self.translator.state()
    }

    /// Returns whether session material is currently held.
    #[must_use]
    pub fn has_session_key(&self) -> bool {
        self.session.session_key().is_some()
    }

    /// Commands queued or awaiting an ack.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending()
    }

    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    #[must_use]
    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn request_set_speed(&mut self, speed: u8, now: Instant) {
        self.request(FanCommand::SetSpeed(speed), now);
    }

    pub fn request_set_power(&mut self, power: bool, now: Instant) {
        self.request(FanCommand::SetPower(power), now);
    }

    pub fn request_set_oscillation(&mut self, oscillating: bool, now: Instant) {
        self.request(FanCommand::SetOscillation(oscillating), now);
    }

    /// Queues a user command.
    ///
    /// Rejected with [`CommandError::NotConnected`] while no link exists or
    /// discovery is still running.
    #[instrument(skip(self, now), level = "debug", fields(state = %self.session.state()))]
    pub fn request(&mut self, command: FanCommand, now: Instant) {
        if !self.session.state().accepts_commands() {
            debug!(%command, "rejecting command while not connected");
            self.entity
                .write_failed(&command, &CommandError::NotConnected);
            return;
        }

        self.dispatcher.enqueue(command, now);
        if self.config.optimistic() && self.translator.apply_command(command, now).is_some() {
            self.entity.set_state(self.translator.state());
        }
        self.pump(now);
    }

    /// Evaluates handshake and ack deadlines.
    pub fn tick(&mut self, now: Instant) {
        let step = self.session.poll_deadline(now);
        self.apply_step(step, now);

        if self.session.state() == ConnectionState::Ready {
            match self.dispatcher.poll_timeout(now) {
                Some(DispatchEvent::Resend(outbound)) => self.send_command(outbound),
                Some(DispatchEvent::Failed { command, error }) => {
                    self.entity.write_failed(&command.kind(), &error);
                    self.record_failure(now);
                }
                None => {}
            }
            self.pump(now);
        }
        self.sync_connection_state();
    }

    fn pump(&mut self, now: Instant) {
        if self.session.state() != ConnectionState::Ready {
            return;
        }
        if let Some(outbound) = self.dispatcher.next_to_send(self.translator.state(), now) {
            self.send_command(outbound);
        }
    }

    fn send_command(&mut self, outbound: OutboundCommand) {
        let payload = StateBlock::set_state_payload(outbound.sequence, &outbound.target);
        match self.codec.encode(
            Opcode::SetState.as_byte(),
            &payload,
            self.session.session_key(),
        ) {
            Ok(bytes) => {
                debug!(
                    command = %outbound.command,
                    sequence = outbound.sequence,
                    attempt = outbound.attempt,
                    "sending command"
                );
                self.client.write(Opcode::SetState.endpoint(), bytes);
            }
            Err(error) => {
                error!(%error, command = %outbound.command, "failed to encode command");
                if let Some(command) = self.dispatcher.abort_in_flight() {
                    self.entity
                        .write_failed(&command.kind(), &CommandError::Encoding(error));
                }
            }
        }
    }

    fn send_handshake(&mut self, opcode: Opcode, payload: &[u8]) {
        match self.codec.encode(opcode.as_byte(), payload, None) {
            Ok(bytes) => self.client.write(opcode.endpoint(), bytes),
            Err(error) => error!(%error, %opcode, "failed to encode handshake frame"),
        }
    }

    fn apply_step(&mut self, step: SessionStep, now: Instant) {
        match step {
            SessionStep::Idle => {}
            SessionStep::Send { opcode, payload } => self.send_handshake(opcode, &payload),
            SessionStep::Established => {
                self.sync_connection_state();
                self.pump(now);
            }
            SessionStep::Failed(error) => {
                warn!(%error, "dropping link after handshake failure");
                self.drop_commands();
                self.client.disconnect();
            }
        }
    }

    fn record_failure(&mut self, now: Instant) {
        let step = self.session.record_failure(now);
        if self.session.state() == ConnectionState::Degraded {
            self.dispatcher.suspend();
            self.sync_connection_state();
        }
        self.apply_step(step, now);
    }

    fn drop_commands(&mut self) {
        for command in self.dispatcher.clear() {
            self.entity
                .write_failed(&command.kind(), &CommandError::Disconnected);
        }
    }

    fn sync_connection_state(&mut self) {
        let state = self.session.state();
        if state != self.reported_state {
            self.reported_state = state;
            self.entity.connection_changed(state);
        }
    }

    fn on_decode_failure(&mut self, endpoint: EndpointId, error: FrameCodecError, now: Instant) {
        match self.session.state() {
            ConnectionState::Authenticating => {
                let step = self.session.on_handshake_decode_failure(error);
                self.apply_step(step, now);
            }
            ConnectionState::Degraded if endpoint == EndpointId::AuthCharacteristic => {
                let step = self.session.on_handshake_decode_failure(error);
                self.apply_step(step, now);
            }
            ConnectionState::Ready => {
                warn!(%error, %endpoint, "discarding undecodable notification");
                self.record_failure(now);
            }
            state => debug!(%error, %state, "discarding undecodable notification"),
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame.known_opcode() {
            Some(opcode) if opcode.is_handshake() => {
                let step = self.session.on_handshake_frame(&frame, now);
                self.apply_step(step, now);
            }
            Some(Opcode::Ack | Opcode::StateReport) => self.on_application_frame(&frame, now),
            _ => {
                // Unknown and outbound-only opcodes carry nothing for us.
                if let Err(error) = self.translator.on_frame(&frame, now) {
                    debug!(%error, "ignoring frame");
                }
            }
        }
    }

    fn on_application_frame(&mut self, frame: &Frame, now: Instant) {
        let state = self.session.state();
        if !matches!(state, ConnectionState::Ready | ConnectionState::Degraded) {
            debug!(%state, opcode = frame.opcode(), "ignoring application frame before authentication");
            return;
        }
        if !frame.is_encrypted() {
            warn!(opcode = frame.opcode(), "rejecting plaintext application frame");
            self.record_failure(now);
            return;
        }

        if frame.known_opcode() == Some(Opcode::Ack) {
            let [sequence] = frame.payload() else {
                warn!(len = frame.payload().len(), "ack payload must be one byte");
                self.record_failure(now);
                return;
            };
            if let Some(command) = self.dispatcher.on_ack(*sequence) {
                self.session.record_success();
                self.entity.write_succeeded(&command.kind());
                self.pump(now);
            }
            return;
        }

        match self.translator.on_frame(frame, now) {
            Ok(delta) => {
                self.session.record_success();
                self.dispatcher.on_state_report();
                if let Some(delta) = delta {
                    debug!(?delta, "fan state changed");
                    self.entity.set_state(self.translator.state());
                }
            }
            Err(error) => {
                warn!(%error, "discarding state report");
                self.record_failure(now);
            }
        }
    }
}

impl<C, E> BleClientNode for FanController<C, E>
where
    C: BleClient,
    E: FanEntity,
{
    #[instrument(skip(self, _now), level = "info")]
    fn on_connected(&mut self, _now: Instant) {
        self.session.on_connected();
        self.sync_connection_state();
    }

    #[instrument(skip(self, now), level = "info")]
    fn on_services_resolved(&mut self, now: Instant) {
        if self.session.state() != ConnectionState::Connecting {
            debug!(state = %self.session.state(), "ignoring service resolution");
            return;
        }
        self.client.subscribe(EndpointId::AuthCharacteristic);
        self.client.subscribe(EndpointId::StateCharacteristic);
        let step = self.session.on_services_resolved(now);
        self.sync_connection_state();
        self.apply_step(step, now);
    }

    #[instrument(skip(self, _now), level = "info")]
    fn on_disconnected(&mut self, _now: Instant) {
        self.session.on_disconnected();
        self.drop_commands();
        self.sync_connection_state();
    }

    #[instrument(skip(self, bytes, now), level = "debug", fields(len = bytes.len()))]
    fn on_notification(&mut self, endpoint: EndpointId, bytes: &[u8], now: Instant) {
        if !self.session.state().is_linked() {
            debug!("ignoring notification without a link");
            return;
        }

        match self.codec.decode(bytes, self.session.session_key()) {
            Ok(frame) => self.on_frame(frame, now),
            Err(error) => self.on_decode_failure(endpoint, error, now),
        }
        self.sync_connection_state();
    }
}
