use thiserror::Error;

use crate::fan::FanState;
use crate::protocol::DEVICE_SPEED_COUNT;

/// Length of the appliance state block.
pub const STATE_BLOCK_LEN: usize = 20;

const SPEED_MASK: u8 = 0x7F;
const POWER_BIT: u8 = 1 << 3;
const OSCILLATION_BIT: u8 = 1 << 4;
// Sent on every write by the vendor app; the appliance keeps its timer
// settings only when these are present.
const WRITE_TRAILER: [u8; 2] = [0x04, 0x64];

/// Errors returned when a state block carries values outside the protocol.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum StateBlockError {
    #[error("state block must be 20 bytes, got {actual}")]
    WrongLength { actual: usize },
    #[error("reported speed {value} is out of range (0..={max})")]
    SpeedOutOfRange { value: u8, max: u8 },
    #[error("set-state payload is empty")]
    MissingSequence,
}

/// Encodes and decodes the 20-byte fan state block.
///
/// Byte 0 bits 0..=6 carry the speed step, byte 1 bit 3 the power flag and
/// byte 1 bit 4 the oscillation flag.
pub struct StateBlock;

impl StateBlock {
    /// Encodes the block written for a desired state.
    ///
    /// ```
    /// use boneco::{FanState, StateBlock};
    ///
    /// let block = StateBlock::encode(&FanState::new(true, 12, false));
    /// assert_eq!([0x0C, 0x08], block[..2]);
    /// assert_eq!([0x04, 0x64], block[18..]);
    /// ```
    #[must_use]
    pub fn encode(state: &FanState) -> [u8; STATE_BLOCK_LEN] {
        let mut block = [0_u8; STATE_BLOCK_LEN];
        block[0] = state.speed().min(DEVICE_SPEED_COUNT) & SPEED_MASK;
        if state.power() {
            block[1] |= POWER_BIT;
        }
        if state.oscillating() {
            block[1] |= OSCILLATION_BIT;
        }
        block[STATE_BLOCK_LEN - 2..].copy_from_slice(&WRITE_TRAILER);
        block
    }

    /// Decodes a reported state block.
    ///
    /// # Errors
    ///
    /// Returns an error when the block has the wrong length or the speed is
    /// outside `0..=32`.
    pub fn decode(payload: &[u8]) -> Result<FanState, StateBlockError> {
        if payload.len() != STATE_BLOCK_LEN {
            return Err(StateBlockError::WrongLength {
                actual: payload.len(),
            });
        }

        // Bit 7 does not track speed and is ignored.
        let speed = payload[0] & SPEED_MASK;
        if speed > DEVICE_SPEED_COUNT {
            return Err(StateBlockError::SpeedOutOfRange {
                value: speed,
                max: DEVICE_SPEED_COUNT,
            });
        }

        Ok(FanState::new(
            payload[1] & POWER_BIT != 0,
            speed,
            payload[1] & OSCILLATION_BIT != 0,
        ))
    }

    /// Builds a `SetState` payload: sequence number followed by the block.
    #[must_use]
    pub fn set_state_payload(sequence: u8, state: &FanState) -> Vec<u8> {
        let mut payload = Vec::with_capacity(STATE_BLOCK_LEN + 1);
        payload.push(sequence);
        payload.extend_from_slice(&Self::encode(state));
        payload
    }

    /// Splits a `SetState` payload into its sequence number and state.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is empty or the block is invalid.
    pub fn parse_set_state_payload(payload: &[u8]) -> Result<(u8, FanState), StateBlockError> {
        let Some((sequence, block)) = payload.split_first() else {
            return Err(StateBlockError::MissingSequence);
        };
        Ok((*sequence, Self::decode(block)?))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(FanState::new(false, 0, false), [0x00, 0x00])]
    #[case(FanState::new(true, 1, false), [0x01, 0x08])]
    #[case(FanState::new(true, 32, true), [0x20, 0x18])]
    #[case(FanState::new(false, 16, true), [0x10, 0x10])]
    fn encode_sets_speed_and_flags(#[case] state: FanState, #[case] expected: [u8; 2]) {
        let block = StateBlock::encode(&state);
        assert_eq!(expected, [block[0], block[1]]);
        assert_eq!(WRITE_TRAILER, [block[18], block[19]]);
    }

    #[test]
    fn decode_ignores_speed_bit_seven() {
        let mut block = [0_u8; STATE_BLOCK_LEN];
        block[0] = 0x80 | 0x05;
        block[1] = 0x08;

        assert_eq!(
            Ok(FanState::new(true, 5, false)),
            StateBlock::decode(&block)
        );
    }

    #[test]
    fn decode_rejects_out_of_range_speed() {
        let mut block = [0_u8; STATE_BLOCK_LEN];
        block[0] = 33;

        assert_eq!(
            Err(StateBlockError::SpeedOutOfRange { value: 33, max: 32 }),
            StateBlock::decode(&block)
        );
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[case(21)]
    fn decode_rejects_wrong_length(#[case] len: usize) {
        assert_matches!(
            StateBlock::decode(&vec![0_u8; len]),
            Err(StateBlockError::WrongLength { actual }) if actual == len
        );
    }

    #[test]
    fn set_state_payload_round_trips() {
        let state = FanState::new(true, 9, true);
        let payload = StateBlock::set_state_payload(7, &state);

        assert_eq!(Ok((7, state)), StateBlock::parse_set_state_payload(&payload));
        assert_eq!(
            Err(StateBlockError::MissingSequence),
            StateBlock::parse_set_state_payload(&[])
        );
    }
}
