use std::fmt::{self, Display, Formatter};

use crate::hw::FanEvent;

use super::device_view::DeviceView;
use super::painter::Painter;

/// Renders one session event as a pretty line.
pub(crate) struct EventView<'a> {
    event: &'a FanEvent,
    painter: &'a Painter,
}

impl<'a> EventView<'a> {
    pub(crate) fn new(event: &'a FanEvent, painter: &'a Painter) -> Self {
        Self { event, painter }
    }
}

impl Display for EventView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        match self.event {
            FanEvent::Linked { device } => write!(
                f,
                "{} {}",
                painter.heading("linked"),
                DeviceView::new(device, painter)
            ),
            FanEvent::ConnectionChanged { state } => write!(
                f,
                "{} {}",
                painter.heading("connection"),
                painter.connection(*state)
            ),
            FanEvent::StateChanged { state } => {
                write!(f, "{} {}", painter.heading("state"), painter.value(state.to_string()))
            }
            FanEvent::CommandSucceeded { command } => write!(
                f,
                "{} {}",
                painter.success("✓"),
                painter.value(command.to_string())
            ),
            FanEvent::CommandFailed { command, error } => write!(
                f,
                "{} {} {}",
                painter.failure("✗"),
                painter.value(command.to_string()),
                painter.muted(format!("({error})"))
            ),
        }
    }
}
