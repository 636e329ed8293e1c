use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::control::ControlArgs;
use crate::cli::listen::ListenArgs;
use crate::config::{ConfigFile, FanConfig, ReconnectPolicy};
use crate::error::ConfigError;
use crate::fan::FanState;
use crate::hw::{DeviceTarget, FakeAppliance};
use crate::key::DeviceKey;

/// Command-line options for the Boneco BLE fan tool.
#[derive(Debug, Parser)]
#[command(name = "boneco", about = "Control Boneco fans over Bluetooth LE.")]
pub struct Args {
    /// JSON config file. Defaults to the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 32 hex character key shared with the appliance.
    #[arg(long, global = true)]
    device_key: Option<DeviceKey>,
    /// Connect to this BLE address.
    #[arg(long, global = true, conflicts_with = "name")]
    address: Option<String>,
    /// Connect to the appliance advertising exactly this name.
    #[arg(long, global = true)]
    name: Option<String>,
    /// Publish commanded state before the appliance acknowledges it.
    #[arg(long, global = true)]
    optimistic: bool,
    /// Time to wait for a command ack (e.g. `2s`, `500ms`).
    #[arg(long, global = true, value_parser = parse_duration)]
    ack_timeout: Option<Duration>,
    /// Resends of an unacknowledged command.
    #[arg(long, global = true)]
    max_retries: Option<u8>,
    /// Consecutive failures before re-authenticating.
    #[arg(long, global = true)]
    degraded_threshold: Option<u8>,
    #[arg(long, global = true, value_parser = parse_duration)]
    handshake_timeout: Option<Duration>,
    #[arg(long, global = true, value_parser = parse_duration)]
    reconnect_backoff: Option<Duration>,
    /// Give up after this many consecutive reconnect attempts.
    #[arg(long, global = true)]
    reconnect_max_attempts: Option<u32>,
    /// Overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Talk to an in-process fake appliance instead of real hardware.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake appliance never acknowledges commands.
    #[arg(long, global = true, requires = "fake")]
    fake_drop_acks: bool,
    /// Fake appliance rejects every challenge response.
    #[arg(long, global = true, requires = "fake")]
    fake_reject_auth: bool,
    /// Initial fake appliance speed; `0` means powered off.
    #[arg(long, global = true, requires = "fake")]
    fake_speed: Option<u8>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use boneco::{Args, Command, ListenArgs};
    ///
    /// let listen = Args::new(Command::Listen(ListenArgs::new(Some(3))));
    /// let config = Args::new(Command::Config);
    /// let _ = (listen, config);
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            config: None,
            device_key: None,
            address: None,
            name: None,
            optimistic: false,
            ack_timeout: None,
            max_retries: None,
            degraded_threshold: None,
            handshake_timeout: None,
            reconnect_backoff: None,
            reconnect_max_attempts: None,
            log_level: None,
            output: None,
            fake: false,
            fake_drop_acks: false,
            fake_reject_auth: false,
            fake_speed: None,
            command,
        }
    }

    #[must_use]
    pub fn with_device_key(mut self, device_key: DeviceKey) -> Self {
        self.device_key = Some(device_key);
        self
    }

    /// Reads settings from `path` instead of the platform default.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = Some(output);
        self
    }

    /// Enables fake backend mode with pre-built fake settings.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            drop_acks,
            reject_auth,
            speed,
        } = fake;

        self.fake = true;
        self.fake_drop_acks = drop_acks;
        self.fake_reject_auth = reject_auth;
        self.fake_speed = speed;
        self
    }

    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Merges flags over the config file into runtime settings.
    ///
    /// Command-line flags win over file values, which win over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or no device key
    /// is available from either source.
    pub fn into_command_and_settings(self) -> Result<(Command, RuntimeSettings), ConfigError> {
        let file = ConfigFile::discover(self.config.as_deref())?;

        let device_key = self
            .device_key
            .or(file.device_key)
            .ok_or(ConfigError::MissingDeviceKey)?;
        let target = match (self.address.or(file.address), self.name.or(file.name)) {
            (Some(address), _) => DeviceTarget::Address(address),
            (None, Some(name)) => DeviceTarget::Name(name),
            (None, None) => DeviceTarget::default(),
        };
        let reconnect = ReconnectPolicy::builder()
            .maybe_backoff(self.reconnect_backoff.or(file.reconnect_backoff))
            .maybe_max_attempts(self.reconnect_max_attempts.or(file.reconnect_max_attempts))
            .build();
        let config = FanConfig::builder()
            .device_key(device_key)
            .optimistic(self.optimistic || file.optimistic.unwrap_or(false))
            .maybe_ack_timeout(self.ack_timeout.or(file.ack_timeout))
            .maybe_max_retries(self.max_retries.or(file.max_retries))
            .maybe_degraded_threshold(self.degraded_threshold.or(file.degraded_threshold))
            .maybe_handshake_timeout(self.handshake_timeout.or(file.handshake_timeout))
            .reconnect(reconnect)
            .build();
        let fake = self.fake.then_some(FakeArgs {
            drop_acks: self.fake_drop_acks,
            reject_auth: self.fake_reject_auth,
            speed: self.fake_speed,
        });

        Ok((
            self.command,
            RuntimeSettings {
                config,
                target,
                fake,
                log_level: self.log_level,
                output: self.output,
            },
        ))
    }
}

/// Fully resolved settings for one CLI run.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    config: FanConfig,
    target: DeviceTarget,
    fake: Option<FakeArgs>,
    log_level: Option<LogLevel>,
    output: Option<OutputFormat>,
}

impl RuntimeSettings {
    #[must_use]
    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    #[must_use]
    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Fake appliance settings when `--fake` was given.
    #[must_use]
    pub fn fake(&self) -> Option<&FakeArgs> {
        self.fake.as_ref()
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Explicit `--output`; `None` lets the terminal decide.
    #[must_use]
    pub fn output(&self) -> Option<OutputFormat> {
        self.output
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct FakeArgs {
    #[builder(default)]
    drop_acks: bool,
    #[builder(default)]
    reject_auth: bool,
    speed: Option<u8>,
}

impl FakeArgs {
    /// Builds the appliance these arguments describe, sharing `key`.
    #[must_use]
    pub fn appliance(&self, key: &DeviceKey) -> FakeAppliance {
        let speed = self.speed.unwrap_or(0);
        FakeAppliance::builder()
            .key(key.clone())
            .state(FanState::new(speed > 0, speed, false))
            .drop_acks(self.drop_acks)
            .reject_auth(self.reject_auth)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, authenticate and send one command.
    Control(ControlArgs),
    /// Connect, authenticate and print fan state updates.
    Listen(ListenArgs),
    /// Print the effective configuration with the key redacted.
    Config,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Control(_args) => "control",
            Self::Listen(_args) => "listen",
            Self::Config => "config",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command output is rendered.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Coloured, human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "boneco-cli-config-{}-{}.json",
            std::process::id(),
            crc32fast::hash(contents.as_bytes())
        ));
        fs::write(&path, contents).expect("temp config should be writable");
        path
    }

    #[test]
    fn address_and_name_conflict() {
        let result = Args::try_parse_from([
            "boneco", "--address", "AA:BB", "--name", "BONECO F235", "config",
        ]);

        let error = result.expect_err("conflicting targets should fail argument parsing");
        assert_eq!(ErrorKind::ArgumentConflict, error.kind());
    }

    #[test]
    fn fake_flags_require_fake_mode() {
        let result = Args::try_parse_from(["boneco", "--fake-drop-acks", "config"]);

        let error = result.expect_err("fake flags should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn malformed_device_key_is_rejected_at_parse_time() {
        let result = Args::try_parse_from(["boneco", "--device-key", "abc", "config"]);

        let error = result.expect_err("short key should fail argument parsing");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }

    #[rstest]
    #[case::humantime_seconds("3s", Duration::from_secs(3))]
    #[case::humantime_millis("750ms", Duration::from_millis(750))]
    fn ack_timeout_accepts_humantime(#[case] raw: &str, #[case] expected: Duration) {
        let path = write_config("{}");
        let args = Args::try_parse_from([
            "boneco",
            "--config",
            path.to_str().expect("temp path should be utf-8"),
            "--device-key",
            KEY,
            "--ack-timeout",
            raw,
            "config",
        ])
        .expect("arguments should parse");

        let (_command, settings) = args
            .into_command_and_settings()
            .expect("settings should resolve");
        assert_eq!(expected, settings.config().ack_timeout());
    }

    #[test]
    fn flags_override_config_file() {
        let path = write_config(&format!(
            r#"{{"device_key": "{KEY}", "name": "BONECO Office", "max_retries": 5, "ack_timeout_ms": 900}}"#
        ));
        let args = Args::try_parse_from([
            "boneco",
            "--config",
            path.to_str().expect("temp path should be utf-8"),
            "--max-retries",
            "1",
            "config",
        ])
        .expect("arguments should parse");

        let (command, settings) = args
            .into_command_and_settings()
            .expect("settings should resolve");

        assert_matches!(command, Command::Config);
        assert_eq!(1, settings.config().max_retries());
        assert_eq!(Duration::from_millis(900), settings.config().ack_timeout());
        assert_eq!(
            &DeviceTarget::Name("BONECO Office".to_string()),
            settings.target()
        );
        assert!(settings.fake().is_none());
    }

    #[test]
    fn missing_key_is_reported() {
        let path = write_config("{}");
        let args = Args::new(Command::Config).with_config_path(path);

        let result = args.into_command_and_settings();

        assert_matches!(result, Err(ConfigError::MissingDeviceKey));
    }

    #[test]
    fn fake_args_seed_the_appliance() {
        let key = DeviceKey::parse(KEY).expect("test key should parse");
        let appliance = FakeArgs::builder().speed(7).build().appliance(&key);

        assert_eq!(FanState::new(true, 7, false), appliance.state());
    }
}
