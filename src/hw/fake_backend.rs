use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use super::hardware::{BleLink, HardwareClient, LinkEvent};
use super::model::{CharacteristicInfo, DeviceTarget, FoundDevice, ServiceInfo};
use crate::error::InteractionError;
use crate::fan::FanState;
use crate::handlers::{BonecoFrameCodec, FrameCodec, HandshakeHandler, StateBlock};
use crate::key::{DeviceKey, Nonce, SessionKeyMaterial};
use crate::protocol::{EndpointId, Opcode};

const FAKE_ADAPTER_NAME: &str = "fake0";
const DEFAULT_FAKE_NAME: &str = "BONECO F235";
const DEFAULT_FAKE_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const DEFAULT_NONCE_SEED: Nonce = [
    0x5a, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x00,
];

/// Notifications an appliance emits in response to one write.
pub type Notifications = Vec<(EndpointId, Vec<u8>)>;

/// In-process Boneco appliance speaking the real wire protocol.
///
/// ```
/// use boneco::{DeviceKey, EndpointId, FakeAppliance};
///
/// let key = DeviceKey::parse("00112233445566778899aabbccddeeff")?;
/// let mut appliance = FakeAppliance::builder().key(key).build();
/// let replies = appliance.handle_write(EndpointId::StateCharacteristic, &[0xde, 0xad]);
/// assert!(replies.is_empty());
/// # Ok::<(), boneco::InvalidKeyFormat>(())
/// ```
#[derive(Debug, Clone, Builder)]
pub struct FakeAppliance {
    key: DeviceKey,
    #[builder(default)]
    state: FanState,
    #[builder(into, default = DEFAULT_FAKE_NAME.to_string())]
    name: String,
    #[builder(into, default = DEFAULT_FAKE_ADDRESS.to_string())]
    address: String,
    /// Never acknowledge `SetState` writes.
    #[builder(default)]
    drop_acks: bool,
    /// Answer every challenge response with a rejection.
    #[builder(default)]
    reject_auth: bool,
    #[builder(default = DEFAULT_NONCE_SEED)]
    nonce_seed: Nonce,
    #[builder(skip)]
    challenges_issued: u8,
    #[builder(skip)]
    pending_nonce: Option<Nonce>,
    #[builder(skip)]
    session: Option<SessionKeyMaterial>,
    #[builder(skip)]
    codec: BonecoFrameCodec,
}

impl FakeAppliance {
    #[must_use]
    pub fn state(&self) -> FanState {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether a session key is currently established.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_drop_acks(&mut self, drop_acks: bool) {
        self.drop_acks = drop_acks;
    }

    /// Forgets any handshake in progress and the session key.
    pub fn reset_link(&mut self) {
        self.pending_nonce = None;
        self.session = None;
    }

    /// Processes one write from the controller.
    ///
    /// Frames that fail to decode, or arrive out of order, are dropped
    /// without a reply.
    #[instrument(skip(self, bytes), level = "debug", fields(%endpoint, len = bytes.len()))]
    pub fn handle_write(&mut self, endpoint: EndpointId, bytes: &[u8]) -> Notifications {
        let frame = match self.codec.decode(bytes, self.session.as_ref()) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "fake appliance dropped undecodable write");
                return Vec::new();
            }
        };

        match frame.known_opcode() {
            Some(Opcode::AuthRequest) => self.on_auth_request(frame.payload()),
            Some(Opcode::ChallengeResponse) => self.on_challenge_response(frame.payload()),
            Some(Opcode::SetState) if frame.is_encrypted() => self.on_set_state(frame.payload()),
            Some(opcode) => {
                debug!(%opcode, "fake appliance ignored unexpected opcode");
                Vec::new()
            }
            None => {
                debug!(opcode = frame.opcode(), "fake appliance ignored unknown opcode");
                Vec::new()
            }
        }
    }

    /// Changes the state as if a user pressed a button on the appliance.
    ///
    /// Returns the state report to notify, if a session is established.
    pub fn press_buttons(&mut self, state: FanState) -> Notifications {
        self.state = FanState::new(state.power(), state.speed(), state.oscillating());
        self.state_report().into_iter().collect()
    }

    /// Bytes that fail the frame checksum.
    #[must_use]
    pub fn corrupted_notification() -> Vec<u8> {
        vec![Opcode::StateReport.as_byte(), 0x01, 0x00, 0xde, 0xad, 0xbe, 0xef]
    }

    fn on_auth_request(&mut self, payload: &[u8]) -> Notifications {
        if payload != HandshakeHandler::auth_request_payload(&self.key) {
            warn!("fake appliance got an auth request for a different key");
        }
        self.session = None;

        let mut nonce = self.nonce_seed;
        nonce[0] ^= self.challenges_issued;
        self.challenges_issued = self.challenges_issued.wrapping_add(1);
        self.pending_nonce = Some(nonce);

        self.plaintext(Opcode::Challenge, &nonce).into_iter().collect()
    }

    fn on_challenge_response(&mut self, payload: &[u8]) -> Notifications {
        let Some(nonce) = self.pending_nonce.take() else {
            debug!("fake appliance got a challenge response without a challenge");
            return Vec::new();
        };
        let proof_matches = HandshakeHandler::parse_challenge_response(payload)
            .is_ok_and(|proof| proof == self.key.challenge_response(&nonce));
        let accepted = proof_matches && !self.reject_auth;
        if accepted {
            self.session = Some(self.key.derive_session_key(&nonce));
        }
        info!(accepted, "fake appliance answered challenge response");

        self.plaintext(
            Opcode::AuthResult,
            &HandshakeHandler::auth_result_payload(accepted),
        )
        .into_iter()
        .collect()
    }

    fn on_set_state(&mut self, payload: &[u8]) -> Notifications {
        let (sequence, state) = match StateBlock::parse_set_state_payload(payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "fake appliance dropped invalid set state");
                return Vec::new();
            }
        };
        self.state = state;

        // Report first, then ack.
        let mut replies: Notifications = self.state_report().into_iter().collect();
        if self.drop_acks {
            debug!(sequence, "fake appliance dropping ack");
        } else {
            replies.extend(self.encrypted(Opcode::Ack, &[sequence]));
        }
        replies
    }

    fn state_report(&self) -> Option<(EndpointId, Vec<u8>)> {
        self.encrypted(Opcode::StateReport, &StateBlock::encode(&self.state))
    }

    fn plaintext(&self, opcode: Opcode, payload: &[u8]) -> Option<(EndpointId, Vec<u8>)> {
        self.emit(opcode, payload, None)
    }

    fn encrypted(&self, opcode: Opcode, payload: &[u8]) -> Option<(EndpointId, Vec<u8>)> {
        let session = self.session.as_ref()?;
        self.emit(opcode, payload, Some(session))
    }

    fn emit(
        &self,
        opcode: Opcode,
        payload: &[u8],
        session: Option<&SessionKeyMaterial>,
    ) -> Option<(EndpointId, Vec<u8>)> {
        match self.codec.encode(opcode.as_byte(), payload, session) {
            Ok(bytes) => Some((opcode.endpoint(), bytes)),
            Err(error) => {
                warn!(%error, %opcode, "fake appliance failed to encode reply");
                None
            }
        }
    }
}

#[derive(Debug)]
struct FakeShared {
    appliance: FakeAppliance,
    reachable: bool,
    connections: u32,
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl FakeShared {
    fn deliver(&self, notifications: Notifications) {
        let Some(link) = &self.link else {
            return;
        };
        for (endpoint, bytes) in notifications {
            if link
                .send(LinkEvent::Notification { endpoint, bytes })
                .is_err()
            {
                debug!("fake link receiver is gone");
                return;
            }
        }
    }
}

/// Test-side handle onto a [`FakeAppliance`] served by a [`FakeHardwareClient`].
#[derive(Debug, Clone)]
pub struct FakeApplianceHandle {
    shared: Arc<Mutex<FakeShared>>,
}

impl FakeApplianceHandle {
    pub async fn state(&self) -> FanState {
        self.shared.lock().await.appliance.state()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.shared.lock().await.appliance.is_authenticated()
    }

    /// Number of successful connects so far.
    pub async fn connections(&self) -> u32 {
        self.shared.lock().await.connections
    }

    pub async fn set_drop_acks(&self, drop_acks: bool) {
        self.shared.lock().await.appliance.set_drop_acks(drop_acks);
    }

    /// Makes later connects fail with [`InteractionError::DeviceNotFound`].
    pub async fn set_reachable(&self, reachable: bool) {
        self.shared.lock().await.reachable = reachable;
    }

    /// Changes the fan state from the appliance side and notifies it.
    pub async fn press_buttons(&self, state: FanState) {
        let mut shared = self.shared.lock().await;
        let notifications = shared.appliance.press_buttons(state);
        shared.deliver(notifications);
    }

    /// Notifies raw bytes on `endpoint`.
    pub async fn notify_raw(&self, endpoint: EndpointId, bytes: Vec<u8>) {
        self.shared.lock().await.deliver(vec![(endpoint, bytes)]);
    }

    /// Drops the current link from the appliance side.
    pub async fn drop_link(&self) {
        let mut shared = self.shared.lock().await;
        shared.appliance.reset_link();
        if let Some(link) = shared.link.take() {
            let _ = link.send(LinkEvent::Disconnected);
        }
    }
}

/// Hardware client that connects to one in-process appliance.
#[derive(Debug, Clone)]
pub struct FakeHardwareClient {
    handle: FakeApplianceHandle,
}

impl FakeHardwareClient {
    #[must_use]
    pub fn new(appliance: FakeAppliance) -> Self {
        Self {
            handle: FakeApplianceHandle {
                shared: Arc::new(Mutex::new(FakeShared {
                    appliance,
                    reachable: true,
                    connections: 0,
                    link: None,
                })),
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> FakeApplianceHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    #[instrument(skip(self), level = "debug", fields(%target))]
    async fn connect(&self, target: &DeviceTarget) -> Result<Box<dyn BleLink>, InteractionError> {
        let mut shared = self.handle.shared.lock().await;
        let device = FoundDevice::new(
            FAKE_ADAPTER_NAME,
            shared.appliance.address.clone(),
            Some(shared.appliance.name().to_string()),
            Some(-48),
        );
        if !shared.reachable || !device.matches(target) {
            return Err(InteractionError::DeviceNotFound {
                target: target.to_string(),
            });
        }

        let (sender, events) = mpsc::unbounded_channel();
        shared.appliance.reset_link();
        shared.link = Some(sender);
        shared.connections += 1;
        info!(connections = shared.connections, "fake appliance connected");

        Ok(Box::new(FakeLink {
            shared: Arc::clone(&self.handle.shared),
            device,
            services: fake_services(),
            events,
            subscribed: HashSet::new(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct FakeLink {
    shared: Arc<Mutex<FakeShared>>,
    device: FoundDevice,
    services: Vec<ServiceInfo>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    subscribed: HashSet<EndpointId>,
    closed: bool,
}

#[async_trait]
impl BleLink for FakeLink {
    fn device(&self) -> &FoundDevice {
        &self.device
    }

    fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    async fn subscribe(&mut self, endpoint: EndpointId) -> Result<(), InteractionError> {
        self.subscribed.insert(endpoint);
        Ok(())
    }

    async fn write(&mut self, endpoint: EndpointId, bytes: &[u8]) -> Result<(), InteractionError> {
        if self.closed {
            return Err(InteractionError::LinkClosed);
        }
        let mut shared = self.shared.lock().await;
        let notifications = shared.appliance.handle_write(endpoint, bytes);
        shared.deliver(notifications);
        Ok(())
    }

    async fn next_event(&mut self) -> LinkEvent {
        while !self.closed {
            match self.events.recv().await {
                Some(LinkEvent::Notification { endpoint, bytes }) => {
                    if self.subscribed.contains(&endpoint) {
                        return LinkEvent::Notification { endpoint, bytes };
                    }
                    debug!(%endpoint, "fake link dropped notification on unsubscribed endpoint");
                }
                Some(LinkEvent::Disconnected) | None => self.closed = true,
            }
        }
        LinkEvent::Disconnected
    }

    async fn close(self: Box<Self>) -> Result<(), InteractionError> {
        let mut shared = self.shared.lock().await;
        shared.link = None;
        shared.appliance.reset_link();
        Ok(())
    }
}

fn fake_services() -> Vec<ServiceInfo> {
    let characteristic = |endpoint: EndpointId| {
        CharacteristicInfo::new(
            endpoint.uuid(),
            vec!["write".to_string(), "notify".to_string()],
        )
    };

    vec![
        ServiceInfo::new(
            EndpointId::AuthService.uuid(),
            true,
            vec![characteristic(EndpointId::AuthCharacteristic)],
        ),
        ServiceInfo::new(
            EndpointId::StateService.uuid(),
            true,
            vec![characteristic(EndpointId::StateCharacteristic)],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handlers::{AuthOutcome, Frame};
    use crate::hw::endpoints::resolve_endpoints;

    fn key() -> DeviceKey {
        DeviceKey::parse("00112233445566778899aabbccddeeff").expect("test key should parse")
    }

    fn write(appliance: &mut FakeAppliance, opcode: Opcode, payload: &[u8]) -> Notifications {
        let bytes = BonecoFrameCodec
            .encode(opcode.as_byte(), payload, None)
            .expect("frame should encode");
        appliance.handle_write(opcode.endpoint(), &bytes)
    }

    fn decode_single(notifications: &Notifications, session: Option<&SessionKeyMaterial>) -> Frame {
        assert_eq!(1, notifications.len());
        BonecoFrameCodec
            .decode(&notifications[0].1, session)
            .expect("reply should decode")
    }

    fn authenticate(appliance: &mut FakeAppliance) -> SessionKeyMaterial {
        let key = key();
        let replies = write(
            appliance,
            Opcode::AuthRequest,
            &HandshakeHandler::auth_request_payload(&key),
        );
        let challenge = decode_single(&replies, None);
        let nonce = HandshakeHandler::parse_challenge(challenge.payload())
            .expect("challenge should carry a nonce");
        let replies = write(
            appliance,
            Opcode::ChallengeResponse,
            &HandshakeHandler::challenge_response_payload(&key, &nonce),
        );
        let result = decode_single(&replies, None);
        assert_eq!(
            Ok(AuthOutcome::Accepted),
            HandshakeHandler::parse_auth_result(result.payload())
        );
        key.derive_session_key(&nonce)
    }

    #[test]
    fn handshake_establishes_a_session() {
        let mut appliance = FakeAppliance::builder().key(key()).build();

        authenticate(&mut appliance);

        assert!(appliance.is_authenticated());
    }

    #[test]
    fn wrong_proof_is_rejected() {
        let mut appliance = FakeAppliance::builder().key(key()).build();
        write(&mut appliance, Opcode::AuthRequest, &[0; 4]);

        let mut forged = vec![0x03, 0x01];
        forged.extend([0_u8; 16]);

        let replies = write(&mut appliance, Opcode::ChallengeResponse, &forged);

        let result = decode_single(&replies, None);
        assert_matches!(
            HandshakeHandler::parse_auth_result(result.payload()),
            Ok(AuthOutcome::Rejected { .. })
        );
        assert!(!appliance.is_authenticated());
    }

    #[test]
    fn set_state_is_acked_and_reported() {
        let mut appliance = FakeAppliance::builder().key(key()).build();
        let session = authenticate(&mut appliance);
        let target = FanState::new(true, 9, true);
        let bytes = BonecoFrameCodec
            .encode(
                Opcode::SetState.as_byte(),
                &StateBlock::set_state_payload(7, &target),
                Some(&session),
            )
            .expect("set state should encode");

        let replies = appliance.handle_write(EndpointId::StateCharacteristic, &bytes);

        assert_eq!(2, replies.len());
        let ack = BonecoFrameCodec
            .decode(&replies[1].1, Some(&session))
            .expect("ack should decode");
        assert_eq!(Some(Opcode::Ack), ack.known_opcode());
        assert_eq!(&[7], ack.payload());
        assert_eq!(target, appliance.state());
    }

    #[test]
    fn plaintext_set_state_is_ignored() {
        let mut appliance = FakeAppliance::builder().key(key()).build();
        authenticate(&mut appliance);

        let replies = write(
            &mut appliance,
            Opcode::SetState,
            &StateBlock::set_state_payload(0, &FanState::new(true, 3, false)),
        );

        assert!(replies.is_empty());
        assert_eq!(FanState::default(), appliance.state());
    }

    #[test]
    fn fake_services_satisfy_endpoint_resolution() {
        assert!(resolve_endpoints(&fake_services()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_appliance_is_not_found() {
        let client = FakeHardwareClient::new(FakeAppliance::builder().key(key()).build());
        client.handle().set_reachable(false).await;

        let result = client.connect(&DeviceTarget::default()).await;

        assert_matches!(result, Err(InteractionError::DeviceNotFound { .. }));
    }
}
