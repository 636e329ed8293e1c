use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::fan::{FanCommand, FanState};

use super::FrameCodecError;

/// Errors surfaced to the fan entity when a command cannot be applied.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CommandError {
    /// The appliance never acknowledged the command.
    #[error("command was not acknowledged after {attempts} attempts")]
    AckTimeout { attempts: u8 },
    /// The command arrived while no connection existed.
    #[error("fan is not connected")]
    NotConnected,
    /// The connection dropped before the command completed.
    #[error("connection dropped before the command completed")]
    Disconnected,
    /// The command frame could not be built.
    #[error("command frame could not be encoded")]
    Encoding(#[from] FrameCodecError),
}

/// A queued user intent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingCommand {
    kind: FanCommand,
    enqueued_at: Instant,
    retries_remaining: u8,
}

impl PendingCommand {
    /// Creates a command with a retry budget.
    #[must_use]
    pub fn new(kind: FanCommand, enqueued_at: Instant, retries_remaining: u8) -> Self {
        Self {
            kind,
            enqueued_at,
            retries_remaining,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FanCommand {
        self.kind
    }

    #[must_use]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    #[must_use]
    pub fn retries_remaining(&self) -> u8 {
        self.retries_remaining
    }
}

/// One write the controller must put on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OutboundCommand {
    pub sequence: u8,
    pub command: FanCommand,
    pub target: FanState,
    pub attempt: u8,
}

/// Result of a deadline check.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchEvent {
    /// The ack deadline passed and the command goes out again.
    Resend(OutboundCommand),
    /// The retry budget is spent.
    Failed {
        command: PendingCommand,
        error: CommandError,
    },
}

#[derive(Debug, Clone)]
struct InFlightCommand {
    command: PendingCommand,
    sequence: u8,
    target: FanState,
    attempts: u8,
    deadline: Instant,
}

impl InFlightCommand {
    fn outbound(&self) -> OutboundCommand {
        OutboundCommand {
            sequence: self.sequence,
            command: self.command.kind,
            target: self.target,
            attempt: self.attempts,
        }
    }
}

/// FIFO command queue with a single in-flight slot.
///
/// The appliance does not pipeline writes, so a new command only goes out
/// after the previous one was acknowledged or gave up.
#[derive(Debug)]
pub struct CommandDispatcher {
    queue: VecDeque<PendingCommand>,
    in_flight: Option<InFlightCommand>,
    acknowledged: Option<FanState>,
    next_sequence: u8,
    ack_timeout: Duration,
    max_retries: u8,
}

impl CommandDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new(ack_timeout: Duration, max_retries: u8) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            acknowledged: None,
            next_sequence: 0,
            ack_timeout,
            max_retries,
        }
    }

    /// Queues a command behind any already pending ones.
    #[instrument(skip(self), level = "debug", fields(queued = self.queue.len()))]
    pub fn enqueue(&mut self, kind: FanCommand, now: Instant) {
        self.queue
            .push_back(PendingCommand::new(kind, now, self.max_retries));
    }

    /// Takes the next queued command when nothing is in flight.
    ///
    /// The target state is fixed here, so retries resend the same bytes even
    /// if the reported state moves in between. It builds on the last
    /// acknowledged target when no report has arrived since that ack, and on
    /// `base` otherwise.
    pub fn next_to_send(&mut self, base: &FanState, now: Instant) -> Option<OutboundCommand> {
        if self.in_flight.is_some() {
            return None;
        }
        let base = self.acknowledged.as_ref().unwrap_or(base);
        let command = self.queue.pop_front()?;
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let in_flight = InFlightCommand {
            target: base.with_command(command.kind),
            command,
            sequence,
            attempts: 1,
            deadline: now + self.ack_timeout,
        };
        let outbound = in_flight.outbound();
        self.in_flight = Some(in_flight);
        Some(outbound)
    }

    /// Completes the in-flight command when `sequence` matches it.
    pub fn on_ack(&mut self, sequence: u8) -> Option<PendingCommand> {
        match &self.in_flight {
            Some(in_flight) if in_flight.sequence == sequence => {
                let in_flight = self.in_flight.take()?;
                self.acknowledged = Some(in_flight.target);
                Some(in_flight.command)
            }
            Some(in_flight) => {
                debug!(
                    sequence,
                    expected = in_flight.sequence,
                    "ignoring ack for a different command"
                );
                None
            }
            None => {
                debug!(sequence, "ignoring ack with no command in flight");
                None
            }
        }
    }

    /// Checks the ack deadline of the in-flight command.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<DispatchEvent> {
        let in_flight = self.in_flight.as_mut()?;
        if now < in_flight.deadline {
            return None;
        }

        if in_flight.command.retries_remaining == 0 {
            let attempts = in_flight.attempts;
            let command = self.in_flight.take()?.command;
            warn!(command = %command.kind, attempts, "command was never acknowledged");
            return Some(DispatchEvent::Failed {
                command,
                error: CommandError::AckTimeout { attempts },
            });
        }

        in_flight.command.retries_remaining -= 1;
        in_flight.attempts = in_flight.attempts.saturating_add(1);
        in_flight.deadline = now + self.ack_timeout;
        debug!(
            command = %in_flight.command.kind,
            attempt = in_flight.attempts,
            "ack deadline passed, resending"
        );
        Some(DispatchEvent::Resend(in_flight.outbound()))
    }

    /// Forgets the last acknowledged target once a newer report supersedes it.
    pub fn on_state_report(&mut self) {
        self.acknowledged = None;
    }

    /// Last acknowledged target not yet superseded by a report.
    #[must_use]
    pub fn acknowledged_state(&self) -> Option<&FanState> {
        self.acknowledged.as_ref()
    }

    /// Returns the in-flight command to the head of the queue.
    ///
    /// Its target is recomputed when it is sent again.
    pub fn suspend(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.queue.push_front(in_flight.command);
        }
    }

    /// Gives up on the in-flight command without waiting for its deadline.
    pub fn abort_in_flight(&mut self) -> Option<PendingCommand> {
        self.in_flight.take().map(|in_flight| in_flight.command)
    }

    /// Drops every queued and in-flight command.
    pub fn clear(&mut self) -> Vec<PendingCommand> {
        self.acknowledged = None;
        let mut dropped: Vec<PendingCommand> = self
            .in_flight
            .take()
            .map(|in_flight| in_flight.command)
            .into_iter()
            .collect();
        dropped.extend(self.queue.drain(..));
        dropped
    }

    /// The command currently awaiting an ack.
    #[must_use]
    pub fn in_flight(&self) -> Option<&PendingCommand> {
        self.in_flight.as_ref().map(|in_flight| &in_flight.command)
    }

    /// Number of commands waiting behind the in-flight one.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Total commands not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}
