use std::io::{self, IsTerminal};

/// Answers questions about the process's terminal.
pub trait TerminalClient {
    fn stdout_is_terminal(&self) -> bool;

    fn stderr_is_terminal(&self) -> bool;
}

/// [`TerminalClient`] backed by the real standard streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTerminalClient;

impl TerminalClient for SystemTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        io::stdout().is_terminal()
    }

    fn stderr_is_terminal(&self) -> bool {
        io::stderr().is_terminal()
    }
}
