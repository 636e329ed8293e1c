use std::time::{Duration, Instant};

use serde::Serialize;
use strum_macros::{Display, EnumIter};
use tracing::{debug, info, instrument, warn};

use crate::handlers::{AuthOutcome, Frame, FrameCodecError, HandshakeError, HandshakeHandler};
use crate::key::{DeviceKey, Nonce, SessionKeyMaterial};
use crate::protocol::Opcode;
use crate::utils::format_hex;

/// Connection lifecycle of one appliance.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
}

impl ConnectionState {
    /// Returns whether a BLE link exists in this state.
    #[must_use]
    pub fn is_linked(self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Returns whether commands may be queued in this state.
    #[must_use]
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Authenticating | Self::Ready | Self::Degraded)
    }
}

/// What the controller must do after feeding the session an event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionStep {
    /// Nothing to do.
    Idle,
    /// Write one plaintext handshake frame.
    Send { opcode: Opcode, payload: Vec<u8> },
    /// Session material is installed and application traffic may flow.
    Established,
    /// The handshake failed; the link must be dropped.
    Failed(HandshakeError),
}

#[derive(Debug)]
struct Handshake {
    deadline: Instant,
    nonce: Option<Nonce>,
}

/// Connection and authentication state machine.
///
/// Pure and clock-free: every method takes the current instant and returns the
/// follow-up the caller must perform.
#[derive(Debug)]
pub struct Session {
    key: DeviceKey,
    state: ConnectionState,
    material: Option<SessionKeyMaterial>,
    handshake: Option<Handshake>,
    consecutive_failures: u8,
    handshake_timeout: Duration,
    degraded_threshold: u8,
}

impl Session {
    #[must_use]
    pub fn new(key: DeviceKey, handshake_timeout: Duration, degraded_threshold: u8) -> Self {
        Self {
            key,
            state: ConnectionState::Disconnected,
            material: None,
            handshake: None,
            consecutive_failures: 0,
            handshake_timeout,
            degraded_threshold: degraded_threshold.max(1),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session material for the current connection, if authenticated.
    #[must_use]
    pub fn session_key(&self) -> Option<&SessionKeyMaterial> {
        self.material.as_ref()
    }

    /// Returns whether a handshake is running.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.handshake.is_some()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    /// The BLE link came up.
    pub fn on_connected(&mut self) {
        if self.state.is_linked() {
            warn!(state = %self.state, "connected event while already linked, restarting session");
        }
        self.reset();
        self.transition(ConnectionState::Connecting);
    }

    /// Service discovery finished; starts the handshake.
    #[instrument(skip(self, now), level = "debug", fields(state = %self.state))]
    pub fn on_services_resolved(&mut self, now: Instant) -> SessionStep {
        if self.state != ConnectionState::Connecting {
            debug!("ignoring service resolution outside of connecting");
            return SessionStep::Idle;
        }
        self.transition(ConnectionState::Authenticating);
        self.start_handshake(now)
    }

    /// The BLE link went away.
    ///
    /// Returns the state the session was in.
    pub fn on_disconnected(&mut self) -> ConnectionState {
        let previous = self.state;
        self.reset();
        self.transition(ConnectionState::Disconnected);
        previous
    }

    /// Feeds one plaintext handshake frame.
    #[instrument(skip(self, frame, now), level = "debug", fields(state = %self.state, opcode = frame.opcode()))]
    pub fn on_handshake_frame(&mut self, frame: &Frame, now: Instant) -> SessionStep {
        let Some(handshake) = self.handshake.as_mut() else {
            debug!("ignoring handshake frame with no handshake running");
            return SessionStep::Idle;
        };
        debug!(payload = %format_hex(frame.payload()), "handshake frame");

        match frame.known_opcode() {
            Some(Opcode::Challenge) => match HandshakeHandler::parse_challenge(frame.payload()) {
                Ok(nonce) => {
                    handshake.nonce = Some(nonce);
                    SessionStep::Send {
                        opcode: Opcode::ChallengeResponse,
                        payload: HandshakeHandler::challenge_response_payload(&self.key, &nonce)
                            .to_vec(),
                    }
                }
                Err(error) => self.fail(error),
            },
            Some(Opcode::AuthResult) => {
                let Some(nonce) = handshake.nonce else {
                    debug!("ignoring auth result received before a challenge");
                    return SessionStep::Idle;
                };
                match HandshakeHandler::parse_auth_result(frame.payload()) {
                    Ok(AuthOutcome::Accepted) => self.establish(&nonce),
                    Ok(AuthOutcome::Rejected { status }) => {
                        self.fail(HandshakeError::Rejected { status })
                    }
                    Err(error) => self.fail(error),
                }
            }
            _ => {
                debug!(deadline_in = ?handshake.deadline.saturating_duration_since(now), "ignoring unexpected frame during handshake");
                SessionStep::Idle
            }
        }
    }

    /// A handshake frame could not be decoded.
    pub fn on_handshake_decode_failure(&mut self, error: FrameCodecError) -> SessionStep {
        if self.handshake.is_none() {
            return SessionStep::Idle;
        }
        self.fail(HandshakeError::Corrupted(error))
    }

    /// Checks the handshake deadline.
    pub fn poll_deadline(&mut self, now: Instant) -> SessionStep {
        let expired = self
            .handshake
            .as_ref()
            .is_some_and(|handshake| now >= handshake.deadline);
        if !expired {
            return SessionStep::Idle;
        }
        self.fail(HandshakeError::Timeout {
            timeout: self.handshake_timeout,
        })
    }

    /// Records a failed notification or command while ready.
    ///
    /// Reaching the threshold enters `Degraded` and starts re-authentication.
    pub fn record_failure(&mut self, now: Instant) -> SessionStep {
        if self.state != ConnectionState::Ready {
            return SessionStep::Idle;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        debug!(failures = self.consecutive_failures, threshold = self.degraded_threshold, "recorded failure");
        if self.consecutive_failures < self.degraded_threshold {
            return SessionStep::Idle;
        }

        warn!(failures = self.consecutive_failures, "session degraded, re-authenticating");
        self.transition(ConnectionState::Degraded);
        self.start_handshake(now)
    }

    /// Records a successfully handled ack or state report.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn start_handshake(&mut self, now: Instant) -> SessionStep {
        self.handshake = Some(Handshake {
            deadline: now + self.handshake_timeout,
            nonce: None,
        });
        SessionStep::Send {
            opcode: Opcode::AuthRequest,
            payload: HandshakeHandler::auth_request_payload(&self.key).to_vec(),
        }
    }

    fn establish(&mut self, nonce: &Nonce) -> SessionStep {
        self.material = Some(self.key.derive_session_key(nonce));
        self.handshake = None;
        self.consecutive_failures = 0;
        self.transition(ConnectionState::Ready);
        SessionStep::Established
    }

    fn fail(&mut self, error: HandshakeError) -> SessionStep {
        warn!(%error, state = %self.state, "handshake failed");
        self.reset();
        self.transition(ConnectionState::Disconnected);
        SessionStep::Failed(error)
    }

    fn reset(&mut self) {
        self.material = None;
        self.handshake = None;
        self.consecutive_failures = 0;
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "connection state changed");
            self.state = next;
        }
    }
}
