use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::protocol::DEVICE_SPEED_COUNT;

/// Logical fan state as seen by UI/automation collaborators.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct FanState {
    power: bool,
    speed: u8,
    oscillating: bool,
    #[serde(skip)]
    last_updated: Option<Instant>,
}

impl FanState {
    /// Creates a state with no update timestamp.
    ///
    /// ```
    /// use boneco::FanState;
    ///
    /// let state = FanState::new(true, 12, false);
    /// assert_eq!(12, state.speed());
    /// assert!(state.last_updated().is_none());
    /// ```
    #[must_use]
    pub fn new(power: bool, speed: u8, oscillating: bool) -> Self {
        Self {
            power,
            speed,
            oscillating,
            last_updated: None,
        }
    }

    #[must_use]
    pub fn power(&self) -> bool {
        self.power
    }

    #[must_use]
    pub fn speed(&self) -> u8 {
        self.speed
    }

    #[must_use]
    pub fn oscillating(&self) -> bool {
        self.oscillating
    }

    /// When the state last changed.
    #[must_use]
    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    /// Returns whether the logical fields match, ignoring the timestamp.
    #[must_use]
    pub fn same_settings(&self, other: &Self) -> bool {
        self.power == other.power
            && self.speed == other.speed
            && self.oscillating == other.oscillating
    }

    /// Computes the fields of `next` that differ from `self`.
    #[must_use]
    pub fn delta_to(&self, next: &Self) -> FanStateDelta {
        FanStateDelta {
            power: (self.power != next.power).then_some(next.power),
            speed: (self.speed != next.speed).then_some(next.speed),
            oscillating: (self.oscillating != next.oscillating).then_some(next.oscillating),
        }
    }

    /// Applies a delta and stamps the update time.
    pub(crate) fn apply(&mut self, delta: &FanStateDelta, now: Instant) {
        if let Some(power) = delta.power {
            self.power = power;
        }
        if let Some(speed) = delta.speed {
            self.speed = speed;
        }
        if let Some(oscillating) = delta.oscillating {
            self.oscillating = oscillating;
        }
        self.last_updated = Some(now);
    }

    /// Returns the state the appliance should end up in after `command`.
    ///
    /// `SetSpeed(0)` switches the fan off, any other speed switches it on, and
    /// powering on at speed 0 starts at the lowest step.
    ///
    /// ```
    /// use boneco::{FanCommand, FanState};
    ///
    /// let off = FanState::new(false, 0, false);
    /// let on = off.with_command(FanCommand::SetPower(true));
    /// assert_eq!((true, 1), (on.power(), on.speed()));
    /// ```
    #[must_use]
    pub fn with_command(&self, command: FanCommand) -> Self {
        let mut next = *self;
        match command {
            FanCommand::SetSpeed(0) => next.power = false,
            FanCommand::SetSpeed(speed) => {
                next.power = true;
                next.speed = speed.min(DEVICE_SPEED_COUNT);
            }
            FanCommand::SetPower(power) => {
                next.power = power;
                if power && next.speed == 0 {
                    next.speed = 1;
                }
            }
            FanCommand::SetOscillation(oscillating) => next.oscillating = oscillating,
        }
        next
    }
}

impl fmt::Display for FanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "power={} speed={}/{} oscillating={}",
            if self.power { "on" } else { "off" },
            self.speed,
            DEVICE_SPEED_COUNT,
            self.oscillating
        )
    }
}

/// Fields changed by one update; `None` means unchanged.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct FanStateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oscillating: Option<bool>,
}

impl FanStateDelta {
    /// Returns whether no field changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.power.is_none() && self.speed.is_none() && self.oscillating.is_none()
    }
}

/// User intent issued against the fan.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FanCommand {
    #[display("set speed {_0}")]
    SetSpeed(u8),
    #[display("set power {}", if *_0 { "on" } else { "off" })]
    SetPower(bool),
    #[display("set oscillation {}", if *_0 { "on" } else { "off" })]
    SetOscillation(bool),
}
