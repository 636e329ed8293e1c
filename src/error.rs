use std::path::PathBuf;

use derive_more::From;
use thiserror::Error;

use crate::handlers::{CommandError, FrameCodecError, HandshakeError, StateBlockError};
use crate::key::InvalidKeyFormat;
use crate::notification::TranslateError;
use crate::protocol::{EndpointId, endpoint_metadata};

/// Errors returned by BLE interaction operations.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("no Boneco appliance matching {target} was found")]
    DeviceNotFound { target: String },
    #[error(
        "required endpoint `{name}` ({uuid}) was not found on the connected device",
        name = endpoint_metadata(*endpoint).name(),
        uuid = endpoint_metadata(*endpoint).uuid()
    )]
    MissingEndpoint { endpoint: EndpointId },
    #[error("required Boneco endpoints are missing: {missing}")]
    MissingRequiredEndpoints { missing: String },
    #[error("the BLE link is closed")]
    LinkClosed,
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("failed while waiting for Ctrl+C")]
    CtrlC { source: std::io::Error },
}

/// Errors returned while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file `{}` is invalid", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no device key configured; pass --device-key or set `device_key` in the config file")]
    MissingDeviceKey,
    #[error(transparent)]
    Key(#[from] InvalidKeyFormat),
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level protocol errors wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum ProtocolError {
    #[error(transparent)]
    #[from(InvalidKeyFormat, Box<InvalidKeyFormat>)]
    Key(Box<InvalidKeyFormat>),
    #[error(transparent)]
    #[from(FrameCodecError, Box<FrameCodecError>)]
    FrameCodec(Box<FrameCodecError>),
    #[error(transparent)]
    #[from(HandshakeError, Box<HandshakeError>)]
    Handshake(Box<HandshakeError>),
    #[error(transparent)]
    #[from(StateBlockError, Box<StateBlockError>)]
    StateBlock(Box<StateBlockError>),
    #[error(transparent)]
    #[from(TranslateError, Box<TranslateError>)]
    Translate(Box<TranslateError>),
    #[error(transparent)]
    #[from(CommandError, Box<CommandError>)]
    Command(Box<CommandError>),
    #[error(transparent)]
    #[from(InteractionError, Box<InteractionError>)]
    Interaction(Box<InteractionError>),
    #[error(transparent)]
    #[from(ConfigError, Box<ConfigError>)]
    Config(Box<ConfigError>),
}
