use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::session::ConnectionState;

/// Applies colour and style to terminal text.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().cyan())
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().green())
    }

    pub(crate) fn warning<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().yellow())
    }

    pub(crate) fn failure<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().red())
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().dimmed())
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold())
    }

    /// Green when usable, yellow when recovering, dimmed otherwise.
    pub(crate) fn connection(&self, state: ConnectionState) -> String {
        let label = state.to_string();
        match state {
            ConnectionState::Ready => self.success(label),
            ConnectionState::Degraded | ConnectionState::Disconnected => self.warning(label),
            ConnectionState::Connecting | ConnectionState::Authenticating => self.muted(label),
        }
    }

    fn paint(&self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}
