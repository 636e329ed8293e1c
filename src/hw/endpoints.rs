use std::collections::HashMap;

use tracing::instrument;

use super::model::{CharacteristicInfo, ServiceInfo};
use crate::error::InteractionError;
use crate::protocol::{self, EndpointId};

/// Characteristics that must be present before the handshake can start.
const REQUIRED_CHARACTERISTICS: [(EndpointId, EndpointId); 2] = [
    (EndpointId::AuthService, EndpointId::AuthCharacteristic),
    (EndpointId::StateService, EndpointId::StateCharacteristic),
];

/// UUIDs of the endpoints found on a connected appliance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedEndpoints {
    uuids: HashMap<EndpointId, String>,
}

impl ResolvedEndpoints {
    /// Returns the lowercase UUID of a resolved endpoint.
    #[must_use]
    pub fn uuid(&self, endpoint: EndpointId) -> Option<&str> {
        self.uuids.get(&endpoint).map(String::as_str)
    }

    /// Maps a notifying characteristic UUID back to its endpoint.
    #[must_use]
    pub fn endpoint_for(&self, uuid: &str) -> Option<EndpointId> {
        self.uuids
            .iter()
            .find(|(endpoint, candidate)| {
                is_characteristic(**endpoint) && candidate.eq_ignore_ascii_case(uuid)
            })
            .map(|(endpoint, _uuid)| *endpoint)
    }
}

/// Resolves the Boneco auth and state endpoints from discovered services.
///
/// Both characteristics must support a write and notify or indicate.
///
/// # Errors
///
/// Returns [`InteractionError::MissingRequiredEndpoints`] naming every
/// endpoint that is absent or lacks the needed properties.
#[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
pub fn resolve_endpoints(services: &[ServiceInfo]) -> Result<ResolvedEndpoints, InteractionError> {
    let mut uuids = HashMap::new();
    let mut missing = Vec::new();

    for (service_id, characteristic_id) in REQUIRED_CHARACTERISTICS {
        let Some(service) = find_service(services, service_id.uuid()) else {
            missing.push(service_id);
            missing.push(characteristic_id);
            continue;
        };
        uuids.insert(service_id, service.uuid().to_ascii_lowercase());

        match find_characteristic(service, characteristic_id.uuid()) {
            Some(characteristic) if supports_write(characteristic) && supports_notify(characteristic) => {
                uuids.insert(characteristic_id, characteristic.uuid().to_ascii_lowercase());
            }
            _ => missing.push(characteristic_id),
        }
    }

    if missing.is_empty() {
        Ok(ResolvedEndpoints { uuids })
    } else {
        Err(InteractionError::MissingRequiredEndpoints {
            missing: format_missing_endpoints(&missing),
        })
    }
}

fn is_characteristic(endpoint: EndpointId) -> bool {
    matches!(
        endpoint,
        EndpointId::AuthCharacteristic | EndpointId::StateCharacteristic
    )
}

fn find_service<'a>(services: &'a [ServiceInfo], uuid: &str) -> Option<&'a ServiceInfo> {
    services
        .iter()
        .find(|service| service.uuid().eq_ignore_ascii_case(uuid))
}

fn find_characteristic<'a>(service: &'a ServiceInfo, uuid: &str) -> Option<&'a CharacteristicInfo> {
    service
        .characteristics()
        .iter()
        .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
}

fn supports_write(characteristic: &CharacteristicInfo) -> bool {
    characteristic.has_property("write") || characteristic.has_property("write_without_response")
}

fn supports_notify(characteristic: &CharacteristicInfo) -> bool {
    characteristic.has_property("notify") || characteristic.has_property("indicate")
}

fn format_missing_endpoints(endpoints: &[EndpointId]) -> String {
    endpoints
        .iter()
        .map(|endpoint| {
            let metadata = protocol::endpoint_metadata(*endpoint);
            format!("{} ({})", metadata.name(), metadata.uuid())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn characteristic(endpoint: EndpointId, properties: &[&str]) -> CharacteristicInfo {
        CharacteristicInfo::new(
            endpoint.uuid().to_ascii_uppercase(),
            properties
                .iter()
                .map(|property| (*property).to_string())
                .collect(),
        )
    }

    fn service(endpoint: EndpointId, characteristics: Vec<CharacteristicInfo>) -> ServiceInfo {
        ServiceInfo::new(endpoint.uuid(), true, characteristics)
    }

    fn full_profile() -> Vec<ServiceInfo> {
        vec![
            service(
                EndpointId::AuthService,
                vec![characteristic(EndpointId::AuthCharacteristic, &["write", "notify"])],
            ),
            service(
                EndpointId::StateService,
                vec![characteristic(
                    EndpointId::StateCharacteristic,
                    &["write_without_response", "indicate"],
                )],
            ),
        ]
    }

    #[test]
    fn resolves_both_characteristics_case_insensitively() {
        let resolved = resolve_endpoints(&full_profile()).expect("full profile should resolve");

        assert_eq!(
            Some(EndpointId::StateCharacteristic.uuid()),
            resolved.uuid(EndpointId::StateCharacteristic)
        );
        assert_eq!(
            Some(EndpointId::AuthCharacteristic),
            resolved.endpoint_for(&EndpointId::AuthCharacteristic.uuid().to_ascii_uppercase())
        );
        assert_eq!(None, resolved.endpoint_for(EndpointId::AuthService.uuid()));
    }

    #[rstest]
    #[case::no_state_service(
        vec![service(
            EndpointId::AuthService,
            vec![characteristic(EndpointId::AuthCharacteristic, &["write", "notify"])],
        )],
        "Boneco state service"
    )]
    #[case::auth_without_notify(
        vec![
            service(
                EndpointId::AuthService,
                vec![characteristic(EndpointId::AuthCharacteristic, &["write"])],
            ),
            service(
                EndpointId::StateService,
                vec![characteristic(EndpointId::StateCharacteristic, &["write", "notify"])],
            ),
        ],
        "Boneco challenge/response data"
    )]
    fn missing_endpoints_are_named(
        #[case] services: Vec<ServiceInfo>,
        #[case] expected_fragment: &str,
    ) {
        let error = resolve_endpoints(&services).expect_err("profile should be incomplete");

        assert_matches!(
            error,
            InteractionError::MissingRequiredEndpoints { missing }
            if missing.contains(expected_fragment)
        );
    }
}
