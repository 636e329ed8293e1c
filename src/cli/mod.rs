pub(crate) mod command;
pub(crate) mod config_cmd;
pub(crate) mod control;
pub(crate) mod listen;
pub(crate) mod report;
pub(crate) mod runner;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat, RuntimeSettings};
pub use self::control::{ControlAction, ControlArgs, Toggle};
pub use self::listen::{ListenArgs, ListenStopReason};
