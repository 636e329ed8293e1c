use std::time::Instant;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::fan::{FanCommand, FanState, FanStateDelta};
use crate::handlers::{Frame, StateBlock, StateBlockError};
use crate::protocol::Opcode;

/// Errors returned while translating appliance notifications.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TranslateError {
    #[error("state report could not be decoded")]
    StateReport(#[from] StateBlockError),
}

/// Turns decoded state reports into fan state updates.
///
/// Holds the last-known-good state; a report that fails to decode leaves it
/// untouched.
#[derive(Debug, Default)]
pub struct NotificationTranslator {
    state: FanState,
}

impl NotificationTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known fan state.
    #[must_use]
    pub fn state(&self) -> &FanState {
        &self.state
    }

    /// Translates one frame.
    ///
    /// Returns `Ok(None)` when the report repeats the current state or the
    /// frame is not a state report.
    ///
    /// # Errors
    ///
    /// Returns an error when a state report carries an invalid block.
    #[instrument(skip(self, frame), level = "debug", fields(opcode = frame.opcode()))]
    pub fn on_frame(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Option<FanStateDelta>, TranslateError> {
        match frame.known_opcode() {
            Some(Opcode::StateReport) => {
                let reported = StateBlock::decode(frame.payload())?;
                Ok(self.merge(&reported, now))
            }
            Some(opcode) => {
                debug!(%opcode, "frame carries no fan state");
                Ok(None)
            }
            None => {
                debug!(
                    payload = %crate::utils::format_hex(frame.payload()),
                    "ignoring frame with unknown opcode"
                );
                Ok(None)
            }
        }
    }

    /// Applies a user command ahead of confirmation from the appliance.
    pub fn apply_command(&mut self, command: FanCommand, now: Instant) -> Option<FanStateDelta> {
        let target = self.state.with_command(command);
        self.merge(&target, now)
    }

    fn merge(&mut self, next: &FanState, now: Instant) -> Option<FanStateDelta> {
        let delta = self.state.delta_to(next);
        if delta.is_empty() {
            return None;
        }
        self.state.apply(&delta, now);
        Some(delta)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn report(state: &FanState) -> Frame {
        Frame::new(Opcode::StateReport.as_byte(), StateBlock::encode(state).to_vec())
            .with_encrypted(true)
    }

    #[test]
    fn state_report_yields_changed_fields() {
        let now = Instant::now();
        let mut translator = NotificationTranslator::new();

        let delta = translator
            .on_frame(&report(&FanState::new(true, 6, false)), now)
            .expect("report should translate");

        assert_eq!(
            Some(FanStateDelta {
                power: Some(true),
                speed: Some(6),
                oscillating: None,
            }),
            delta
        );
        assert_eq!(Some(now), translator.state().last_updated());
    }

    #[test]
    fn repeated_report_yields_nothing() {
        let now = Instant::now();
        let mut translator = NotificationTranslator::new();
        let frame = report(&FanState::new(true, 6, false));
        translator
            .on_frame(&frame, now)
            .expect("first report should translate");

        assert_eq!(Ok(None), translator.on_frame(&frame, now));
    }

    #[test]
    fn invalid_report_keeps_last_known_state() {
        let now = Instant::now();
        let mut translator = NotificationTranslator::new();
        translator
            .on_frame(&report(&FanState::new(true, 6, true)), now)
            .expect("report should translate");

        let mut block = StateBlock::encode(&FanState::new(true, 6, true));
        block[0] = 40;
        let result = translator.on_frame(
            &Frame::new(Opcode::StateReport.as_byte(), block.to_vec()),
            now,
        );

        assert_matches!(
            result,
            Err(TranslateError::StateReport(StateBlockError::SpeedOutOfRange { value: 40, .. }))
        );
        assert!(translator.state().same_settings(&FanState::new(true, 6, true)));
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        let mut translator = NotificationTranslator::new();
        assert_eq!(
            Ok(None),
            translator.on_frame(&Frame::new(0x7E, vec![1, 2, 3]), Instant::now())
        );
    }

    #[test]
    fn apply_command_updates_state_optimistically() {
        let mut translator = NotificationTranslator::new();
        let delta = translator.apply_command(FanCommand::SetSpeed(12), Instant::now());

        assert_eq!(
            Some(FanStateDelta {
                power: Some(true),
                speed: Some(12),
                oscillating: None,
            }),
            delta
        );
        assert_eq!(None, translator.apply_command(FanCommand::SetSpeed(12), Instant::now()));
    }
}
