mod app;
mod cli;
mod config;
mod controller;
mod error;
mod fan;
mod handlers;
mod hw;
mod key;
mod notification;
mod protocol;
mod session;
mod telemetry;
mod terminal;
mod utils;

pub use app::{hardware_client_for, run, run_with_clients, run_with_terminal};
pub use cli::{
    Args, Command, ControlAction, ControlArgs, FakeArgs, ListenArgs, ListenStopReason, LogLevel,
    OutputFormat, RuntimeSettings, Toggle,
};
pub use config::{ConfigFile, ConfigSummary, FanConfig, ReconnectPolicy, default_config_path};
pub use controller::FanController;
pub use error::{ConfigError, InteractionError, ProtocolError};
pub use fan::{FanCommand, FanState, FanStateDelta};
pub use handlers::{
    AuthOutcome, BonecoFrameCodec, CommandDispatcher, CommandError, DecryptionFailureReason,
    DispatchEvent, Frame, FrameCodec, FrameCodecError, HandshakeError, HandshakeHandler,
    MalformedFrameReason, OutboundCommand, PendingCommand, STATE_BLOCK_LEN, StateBlock,
    StateBlockError,
};
pub use hw::{
    BleClient, BleClientNode, BleLink, ChannelEntity, CharacteristicInfo, DeviceTarget,
    FakeAppliance, FakeApplianceHandle, FakeHardwareClient, FanEntity, FanEvent, FanSession,
    FoundDevice, HardwareClient, LinkEvent, Notifications, OutboundOp, Outbox, ResolvedEndpoints,
    ServiceInfo, SessionSummary, fake_hardware_client, real_hardware_client, resolve_endpoints,
};
pub use key::{DEVICE_KEY_LEN, DeviceKey, InvalidKeyFormat, NONCE_LEN, Nonce, SessionKeyMaterial};
pub use notification::{NotificationTranslator, TranslateError};
pub use protocol::{DEVICE_SPEED_COUNT, EndpointId, Opcode};
pub use session::{ConnectionState, Session, SessionStep};
pub use terminal::{SystemTerminalClient, TerminalClient};
