mod dispatcher;
mod frame_codec;
mod handshake;
mod state_block;

pub use self::dispatcher::{
    CommandDispatcher, CommandError, DispatchEvent, OutboundCommand, PendingCommand,
};
pub use self::frame_codec::{
    BonecoFrameCodec, DecryptionFailureReason, Frame, FrameCodec, FrameCodecError,
    MalformedFrameReason,
};
pub use self::handshake::{AuthOutcome, HandshakeError, HandshakeHandler};
pub use self::state_block::{STATE_BLOCK_LEN, StateBlock, StateBlockError};
