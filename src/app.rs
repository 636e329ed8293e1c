use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::ui::Painter;
use crate::cli::{Args, Command, LogLevel, OutputFormat, RuntimeSettings};
use crate::cli::{config_cmd, control, listen, report::Reporter};
use crate::hw::{HardwareClient, fake_hardware_client, real_hardware_client};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Picks the fake or real hardware client the settings ask for.
///
/// ```
/// use clap::Parser;
///
/// let args = boneco::Args::try_parse_from([
///     "boneco",
///     "--device-key",
///     "00112233445566778899aabbccddeeff",
///     "--fake",
///     "config",
/// ])?;
/// let (_command, settings) = args.into_command_and_settings()?;
/// let _client = boneco::hardware_client_for(&settings);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[must_use]
pub fn hardware_client_for(settings: &RuntimeSettings) -> Box<dyn HardwareClient> {
    match settings.fake() {
        Some(fake) => fake_hardware_client(fake.appliance(settings.config().device_key())),
        None => real_hardware_client(),
    }
}

/// Parses settings, builds the matching hardware client and runs the command.
///
/// # Errors
///
/// Returns an error if configuration is invalid, tracing initialisation
/// fails, BLE interaction fails, or output writing fails.
pub async fn run<W>(args: Args, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    run_with_terminal(args, out, &SystemTerminalClient).await
}

/// Like [`run`], with an injected terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl boneco::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = boneco::Args::try_parse_from([
///     "boneco",
///     "--device-key",
///     "00112233445566778899aabbccddeeff",
///     "--fake",
///     "control",
///     "speed",
///     "12",
/// ])?;
/// let mut out = Vec::new();
/// boneco::run_with_terminal(args, &mut out, &FakeTerminal).await?;
/// assert!(String::from_utf8(out)?.contains("command_succeeded"));
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error under the same conditions as [`run`].
pub async fn run_with_terminal<W>(
    args: Args,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let (command, settings) = args.into_command_and_settings()?;
    let hardware_client = hardware_client_for(&settings);
    run_with_clients(
        command,
        &settings,
        out,
        terminal_client,
        hardware_client.as_ref(),
    )
    .await
}

/// Runs one command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails,
/// or output writing fails.
#[instrument(
    skip_all,
    level = "info",
    fields(command = command.name(), target = %settings.target())
)]
pub async fn run_with_clients<W>(
    command: Command,
    settings: &RuntimeSettings,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: &dyn HardwareClient,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "boneco",
        terminal_client.stderr_is_terminal(),
        settings.log_level().map(LogLevel::as_level_filter),
    )?;

    let stdout_is_terminal = terminal_client.stdout_is_terminal();
    let format = settings.output().unwrap_or(if stdout_is_terminal {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });
    let painter = Painter::new(stdout_is_terminal && format == OutputFormat::Pretty);
    let reporter = Reporter::new(out, format, painter);

    match command {
        Command::Control(args) => control::run(hardware_client, settings, &args, reporter).await,
        Command::Listen(args) => {
            listen::run(hardware_client, settings, &args, reporter, format).await
        }
        Command::Config => config_cmd::run(settings, reporter, format),
    }
}
