use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::debug;

use crate::error::ConfigError;
use crate::key::DeviceKey;

pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_MAX_RETRIES: u8 = 2;
pub(crate) const DEFAULT_DEGRADED_THRESHOLD: u8 = 3;
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

const CONFIG_FILE_NAME: &str = "config.json";

/// Settings for one fan controller.
///
/// ```
/// use std::time::Duration;
/// use boneco::{DeviceKey, FanConfig};
///
/// let config = FanConfig::builder()
///     .device_key(DeviceKey::parse("00112233445566778899aabbccddeeff")?)
///     .optimistic(true)
///     .build();
/// assert_eq!(Duration::from_secs(2), config.ack_timeout());
/// assert_eq!(3, config.degraded_threshold());
/// # Ok::<(), boneco::InvalidKeyFormat>(())
/// ```
#[derive(Debug, Clone, Builder)]
pub struct FanConfig {
    device_key: DeviceKey,
    #[builder(default)]
    optimistic: bool,
    #[builder(default = DEFAULT_ACK_TIMEOUT)]
    ack_timeout: Duration,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u8,
    #[builder(default = DEFAULT_DEGRADED_THRESHOLD)]
    degraded_threshold: u8,
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT)]
    handshake_timeout: Duration,
    #[builder(default = DEFAULT_TICK_INTERVAL)]
    tick_interval: Duration,
    #[builder(default)]
    reconnect: ReconnectPolicy,
}

impl FanConfig {
    #[must_use]
    pub fn device_key(&self) -> &DeviceKey {
        &self.device_key
    }

    /// Whether commands update the published state before the appliance acks.
    #[must_use]
    pub fn optimistic(&self) -> bool {
        self.optimistic
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Resends after the first attempt; `2` means three attempts in total.
    #[must_use]
    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    #[must_use]
    pub fn degraded_threshold(&self) -> u8 {
        self.degraded_threshold
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// How often the binding drives controller deadlines.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    #[must_use]
    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// Serializable view with the key reduced to its fingerprint.
    #[must_use]
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            key_fingerprint: hex::encode(self.device_key.fingerprint()),
            optimistic: self.optimistic,
            ack_timeout: humantime::format_duration(self.ack_timeout).to_string(),
            max_retries: self.max_retries,
            degraded_threshold: self.degraded_threshold,
            handshake_timeout: humantime::format_duration(self.handshake_timeout).to_string(),
            tick_interval: humantime::format_duration(self.tick_interval).to_string(),
            reconnect_backoff: humantime::format_duration(self.reconnect.backoff).to_string(),
            reconnect_max_attempts: self.reconnect.max_attempts,
        }
    }
}

/// Redacted, printable configuration.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub key_fingerprint: String,
    pub optimistic: bool,
    pub ack_timeout: String,
    pub max_retries: u8,
    pub degraded_threshold: u8,
    pub handshake_timeout: String,
    pub tick_interval: String,
    pub reconnect_backoff: String,
    pub reconnect_max_attempts: Option<u32>,
}

/// When and how often the binding reconnects after losing the appliance.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder)]
pub struct ReconnectPolicy {
    #[builder(default = DEFAULT_RECONNECT_BACKOFF)]
    backoff: Duration,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self::builder().max_attempts(0).build()
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    #[must_use]
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Returns whether reconnect attempt number `attempt` (1-based) is allowed.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Optional settings read from the JSON config file.
///
/// Every field may be overridden on the command line.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub device_key: Option<DeviceKey>,
    pub address: Option<String>,
    pub name: Option<String>,
    pub optimistic: Option<bool>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "ack_timeout_ms")]
    pub ack_timeout: Option<Duration>,
    pub max_retries: Option<u8>,
    pub degraded_threshold: Option<u8>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "handshake_timeout_ms")]
    pub handshake_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "reconnect_backoff_ms")]
    pub reconnect_backoff: Option<Duration>,
    pub reconnect_max_attempts: Option<u32>,
}

impl ConfigFile {
    /// Reads a config file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses config JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON is invalid or names an unknown field.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Loads `explicit` if given, else the platform default when it exists.
    ///
    /// A missing default file yields an empty config; a missing explicit file
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns an error when a file exists but cannot be loaded.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading default config file");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Platform config location, e.g. `~/.config/boneco/config.json`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "boneco").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
