use std::io;

use anyhow::{Result, anyhow, bail};
use clap::{Args, Subcommand, ValueEnum};
use tokio::signal;
use tracing::instrument;

use crate::cli::RuntimeSettings;
use crate::error::InteractionError;
use crate::fan::FanCommand;
use crate::hw::{FanEvent, HardwareClient};
use crate::session::ConnectionState;

use super::report::Reporter;
use super::runner::{SessionChannels, with_session};

/// Arguments for the `control` command.
#[derive(Debug, Args)]
pub struct ControlArgs {
    #[command(subcommand)]
    action: ControlAction,
}

impl ControlArgs {
    /// Creates control arguments for one action.
    ///
    /// ```
    /// use boneco::{ControlAction, ControlArgs, Toggle};
    ///
    /// let args = ControlArgs::new(ControlAction::Power { state: Toggle::On });
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(action: ControlAction) -> Self {
        Self { action }
    }

    #[must_use]
    pub fn command(&self) -> FanCommand {
        self.action.command()
    }
}

/// Action performed by the `control` command.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ControlAction {
    /// Turn the fan on or off.
    Power { state: Toggle },
    /// Set the fan speed (0..=32). `0` turns the fan off.
    Speed { speed: u8 },
    /// Turn oscillation on or off.
    Oscillation { state: Toggle },
}

impl ControlAction {
    fn command(self) -> FanCommand {
        match self {
            Self::Power { state } => FanCommand::SetPower(state.is_on()),
            Self::Speed { speed } => FanCommand::SetSpeed(speed),
            Self::Oscillation { state } => FanCommand::SetOscillation(state.is_on()),
        }
    }
}

/// `on` or `off`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Executes the `control` command.
///
/// Waits for the session to become ready, sends the command once and stops
/// when the appliance acknowledges it or the controller gives up.
#[instrument(skip_all, level = "info", fields(command = %args.command()))]
pub(crate) async fn run<W>(
    hardware: &dyn HardwareClient,
    settings: &RuntimeSettings,
    args: &ControlArgs,
    reporter: Reporter<'_, W>,
) -> Result<()>
where
    W: io::Write,
{
    let command = args.command();
    with_session(hardware, settings, |channels| {
        await_command(channels, command, reporter)
    })
    .await
}

async fn await_command<W>(
    mut channels: SessionChannels,
    command: FanCommand,
    mut reporter: Reporter<'_, W>,
) -> Result<()>
where
    W: io::Write,
{
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sent = false;

    loop {
        let event = tokio::select! {
            event = channels.events.recv() => event,
            interrupted = &mut ctrl_c => {
                interrupted.map_err(|source| InteractionError::CtrlC { source })?;
                bail!("interrupted before `{command}` completed");
            }
        };
        let Some(event) = event else {
            bail!("fan session ended before `{command}` completed");
        };
        reporter.event(&event)?;

        match event {
            FanEvent::ConnectionChanged {
                state: ConnectionState::Ready,
            } if !sent => {
                channels
                    .commands
                    .send(command)
                    .map_err(|_error| anyhow!("fan session stopped accepting commands"))?;
                sent = true;
            }
            FanEvent::CommandSucceeded { command: done } if sent && done == command => {
                return Ok(());
            }
            FanEvent::CommandFailed {
                command: failed,
                error,
            } if sent && failed == command => {
                bail!("`{command}` failed: {error}");
            }
            _ => {}
        }
    }
}
