use std::time::Duration;

use thiserror::Error;

use crate::key::{DeviceKey, Nonce};

use super::FrameCodecError;

const RESPONSE_PREFIX: [u8; 2] = [0x03, 0x01];
const RESULT_MARKER: u8 = 0x04;
const RESULT_ACCEPTED: u8 = 0x02;
const RESULT_REJECTED: u8 = 0x01;
const RESULT_LEN: usize = 3;
const PROOF_LEN: usize = 16;
const PROOF_END: usize = RESPONSE_PREFIX.len() + PROOF_LEN;
const RESPONSE_LEN: usize = 20;

/// Errors raised while authenticating with the appliance.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    /// No accepted auth result arrived before the deadline.
    #[error("handshake did not complete within {}", humantime::format_duration(*timeout))]
    Timeout { timeout: Duration },
    /// The appliance rejected our challenge response.
    #[error("appliance rejected the challenge response (status {status:#04x})")]
    Rejected { status: u8 },
    /// The challenge payload does not carry a 16-byte nonce.
    #[error("challenge payload must be 16 bytes, got {actual}")]
    MalformedChallenge { actual: usize },
    /// The challenge response payload is not a 20-byte response packet.
    #[error("challenge response payload is malformed ({actual} bytes)")]
    MalformedResponse { actual: usize },
    /// The auth result payload is not a `0x04` acknowledgement.
    #[error("auth result payload is malformed ({actual} bytes)")]
    MalformedResult { actual: usize },
    /// A handshake frame failed checksum or structure validation.
    #[error("handshake frame was corrupted")]
    Corrupted(#[source] FrameCodecError),
}

/// Outcome reported by the appliance after a challenge response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthOutcome {
    /// The response matched; encrypted traffic may start.
    Accepted,
    /// The response did not match.
    Rejected { status: u8 },
}

/// Builds and parses handshake payloads.
///
/// Frames are plaintext; the frame codec wraps these payloads without a
/// session key.
pub struct HandshakeHandler;

impl HandshakeHandler {
    /// Payload of the `AuthRequest` frame that solicits a fresh challenge.
    #[must_use]
    pub fn auth_request_payload(key: &DeviceKey) -> [u8; 4] {
        key.fingerprint()
    }

    /// Extracts the nonce from a `Challenge` payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not exactly one nonce long.
    pub fn parse_challenge(payload: &[u8]) -> Result<Nonce, HandshakeError> {
        Nonce::try_from(payload).map_err(|_error| HandshakeError::MalformedChallenge {
            actual: payload.len(),
        })
    }

    /// Builds the `ChallengeResponse` payload for one nonce.
    ///
    /// The proof sits between the prefix and two zero padding bytes.
    ///
    /// ```
    /// use boneco::{DeviceKey, HandshakeHandler};
    ///
    /// let key = DeviceKey::parse("00112233445566778899aabbccddeeff")?;
    /// let payload = HandshakeHandler::challenge_response_payload(&key, &[0x55; 16]);
    /// assert_eq!([0x03, 0x01], payload[..2]);
    /// assert_eq!(20, payload.len());
    /// # Ok::<(), boneco::InvalidKeyFormat>(())
    /// ```
    #[must_use]
    pub fn challenge_response_payload(key: &DeviceKey, nonce: &Nonce) -> [u8; RESPONSE_LEN] {
        let mut payload = [0_u8; RESPONSE_LEN];
        payload[..RESPONSE_PREFIX.len()].copy_from_slice(&RESPONSE_PREFIX);
        payload[RESPONSE_PREFIX.len()..PROOF_END]
            .copy_from_slice(&key.challenge_response(nonce));
        payload
    }

    /// Extracts the proof from a `ChallengeResponse` payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not a response packet.
    pub fn parse_challenge_response(payload: &[u8]) -> Result<[u8; PROOF_LEN], HandshakeError> {
        let malformed = || HandshakeError::MalformedResponse {
            actual: payload.len(),
        };
        if payload.len() != RESPONSE_LEN || !payload.starts_with(&RESPONSE_PREFIX) {
            return Err(malformed());
        }
        <[u8; PROOF_LEN]>::try_from(&payload[RESPONSE_PREFIX.len()..PROOF_END])
            .map_err(|_error| malformed())
    }

    /// Builds an `AuthResult` payload.
    #[must_use]
    pub fn auth_result_payload(accepted: bool) -> [u8; RESULT_LEN] {
        let status = if accepted {
            RESULT_ACCEPTED
        } else {
            RESULT_REJECTED
        };
        [RESULT_MARKER, 0x00, status]
    }

    /// Parses an `AuthResult` payload.
    ///
    /// The appliance sends a result whether or not the response was right;
    /// only status `0x02` means accepted.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is too short or lacks the marker.
    pub fn parse_auth_result(payload: &[u8]) -> Result<AuthOutcome, HandshakeError> {
        match payload {
            [RESULT_MARKER, _, RESULT_ACCEPTED, ..] => Ok(AuthOutcome::Accepted),
            [RESULT_MARKER, _, status, ..] => Ok(AuthOutcome::Rejected { status: *status }),
            _ => Err(HandshakeError::MalformedResult {
                actual: payload.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::parse("00112233445566778899aabbccddeeff").expect("test key should parse")
    }

    #[test]
    fn challenge_response_round_trips_through_parser() {
        let nonce = [0xA5_u8; 16];
        let payload = HandshakeHandler::challenge_response_payload(&key(), &nonce);
        let proof = HandshakeHandler::parse_challenge_response(&payload)
            .expect("response payload should parse");

        assert_eq!(key().challenge_response(&nonce), proof);
    }

    #[test]
    fn challenge_response_pads_proof_to_twenty_bytes() {
        let nonce = [0x3C_u8; 16];
        let payload = HandshakeHandler::challenge_response_payload(&key(), &nonce);

        assert_eq!(RESPONSE_PREFIX, payload[..2]);
        assert_eq!(key().challenge_response(&nonce), payload[2..18]);
        assert_eq!([0x00, 0x00], payload[18..]);
    }

    #[rstest]
    #[case(vec![0x03, 0x01])]
    #[case([vec![0x03, 0x01], vec![0xAA; 16]].concat())]
    #[case([vec![0x03, 0x01], vec![0xAA; 19]].concat())]
    #[case([vec![0x03, 0x02], vec![0xAA; 18]].concat())]
    fn parse_challenge_response_rejects_malformed_packets(#[case] payload: Vec<u8>) {
        assert_eq!(
            Err(HandshakeError::MalformedResponse {
                actual: payload.len()
            }),
            HandshakeHandler::parse_challenge_response(&payload)
        );
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![0x01; 15])]
    #[case(vec![0x01; 18])]
    fn parse_challenge_rejects_wrong_length(#[case] payload: Vec<u8>) {
        assert_eq!(
            Err(HandshakeError::MalformedChallenge {
                actual: payload.len()
            }),
            HandshakeHandler::parse_challenge(&payload)
        );
    }

    #[rstest]
    #[case(&[0x04, 0x00, 0x02], AuthOutcome::Accepted)]
    #[case(&[0x04, 0x01, 0x02, 0xFF], AuthOutcome::Accepted)]
    #[case(&[0x04, 0x00, 0x01], AuthOutcome::Rejected { status: 0x01 })]
    #[case(&[0x04, 0x00, 0x00], AuthOutcome::Rejected { status: 0x00 })]
    fn parse_auth_result_reads_status(#[case] payload: &[u8], #[case] expected: AuthOutcome) {
        assert_eq!(
            Ok(expected),
            HandshakeHandler::parse_auth_result(payload)
        );
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x04, 0x00])]
    #[case(&[0x05, 0x00, 0x02])]
    fn parse_auth_result_rejects_malformed_payloads(#[case] payload: &[u8]) {
        assert_matches!(
            HandshakeHandler::parse_auth_result(payload),
            Err(HandshakeError::MalformedResult { .. })
        );
    }

    #[test]
    fn auth_result_payload_matches_parser() {
        assert_eq!(
            Ok(AuthOutcome::Accepted),
            HandshakeHandler::parse_auth_result(&HandshakeHandler::auth_result_payload(true))
        );
        assert_matches!(
            HandshakeHandler::parse_auth_result(&HandshakeHandler::auth_result_payload(false)),
            Ok(AuthOutcome::Rejected { .. })
        );
    }
}
