use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, FromRepr};

/// Number of discrete speed steps exposed by the appliance.
pub const DEVICE_SPEED_COUNT: u8 = 32;

/// Known Boneco GATT endpoints.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display)]
pub enum EndpointId {
    /// Service carrying the challenge/response handshake.
    #[strum(to_string = "auth_service")]
    AuthService,
    /// Characteristic used for handshake writes and notifications.
    #[strum(to_string = "auth_characteristic")]
    AuthCharacteristic,
    /// Service carrying fan state.
    #[strum(to_string = "state_service")]
    StateService,
    /// Characteristic used for state writes, acks and state reports.
    #[strum(to_string = "state_characteristic")]
    StateCharacteristic,
}

impl EndpointId {
    /// Returns the vendor UUID of this endpoint.
    ///
    /// ```
    /// use boneco::EndpointId;
    ///
    /// assert_eq!(
    ///     "fdce2345-1013-4120-b919-1dbb32a2d132",
    ///     EndpointId::StateCharacteristic.uuid()
    /// );
    /// ```
    #[must_use]
    pub fn uuid(self) -> &'static str {
        endpoint_metadata(self).uuid()
    }
}

/// Endpoint category in GATT.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub(crate) enum EndpointKind {
    #[strum(to_string = "service")]
    Service,
    #[strum(to_string = "characteristic")]
    Characteristic,
}

/// Descriptive metadata for one protocol endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct EndpointMetadata {
    name: &'static str,
    uuid: &'static str,
    kind: EndpointKind,
}

impl EndpointMetadata {
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    pub(crate) fn uuid(self) -> &'static str {
        self.uuid
    }

    pub(crate) fn kind(self) -> EndpointKind {
        self.kind
    }
}

pub(crate) static ENDPOINTS_BY_ID: LazyLock<HashMap<EndpointId, EndpointMetadata>> =
    LazyLock::new(|| {
        EndpointId::iter()
            .map(|endpoint| (endpoint, metadata_for(endpoint)))
            .collect()
    });

/// Returns metadata for one endpoint.
pub(crate) fn endpoint_metadata(endpoint: EndpointId) -> EndpointMetadata {
    *ENDPOINTS_BY_ID
        .get(&endpoint)
        .unwrap_or(&metadata_for(endpoint))
}

fn metadata_for(endpoint: EndpointId) -> EndpointMetadata {
    match endpoint {
        EndpointId::AuthService => EndpointMetadata {
            name: "Boneco challenge/response service",
            uuid: "fdce1236-1013-4120-b919-1dbb32a2d132",
            kind: EndpointKind::Service,
        },
        EndpointId::AuthCharacteristic => EndpointMetadata {
            name: "Boneco challenge/response data",
            uuid: "fdce2347-1013-4120-b919-1dbb32a2d132",
            kind: EndpointKind::Characteristic,
        },
        EndpointId::StateService => EndpointMetadata {
            name: "Boneco state service",
            uuid: "fdce1234-1013-4120-b919-1dbb32a2d132",
            kind: EndpointKind::Service,
        },
        EndpointId::StateCharacteristic => EndpointMetadata {
            name: "Boneco state data",
            uuid: "fdce2345-1013-4120-b919-1dbb32a2d132",
            kind: EndpointKind::Characteristic,
        },
    }
}

/// Frame opcodes understood by the appliance.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    /// Client asks the appliance for a fresh challenge.
    #[strum(to_string = "auth_request")]
    AuthRequest = 0x01,
    /// Appliance sends the handshake nonce.
    #[strum(to_string = "challenge")]
    Challenge = 0x02,
    /// Client proves possession of the device key.
    #[strum(to_string = "challenge_response")]
    ChallengeResponse = 0x03,
    /// Appliance accepts or rejects the challenge response.
    #[strum(to_string = "auth_result")]
    AuthResult = 0x04,
    /// Client writes a desired fan state.
    #[strum(to_string = "set_state")]
    SetState = 0x10,
    /// Appliance reports its current fan state.
    #[strum(to_string = "state_report")]
    StateReport = 0x11,
    /// Appliance acknowledges one `SetState` write.
    #[strum(to_string = "ack")]
    Ack = 0x12,
}

impl Opcode {
    /// Returns the raw opcode byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns whether this opcode belongs to the plaintext handshake.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::AuthRequest | Self::Challenge | Self::ChallengeResponse | Self::AuthResult
        )
    }

    /// Returns the characteristic this opcode travels on.
    #[must_use]
    pub const fn endpoint(self) -> EndpointId {
        if self.is_handshake() {
            EndpointId::AuthCharacteristic
        } else {
            EndpointId::StateCharacteristic
        }
    }
}
