use fwct_abi::HxgDecodeError;

/// Errors surfaced to transport callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CtError {
    #[error("channel is not enabled")]
    NotEnabled,

    /// Corruption was detected or the channel was declared deadlocked. Only a full re-init
    /// recovers.
    #[error("channel is broken")]
    Broken,

    #[error("not enough room in the transport buffers")]
    Busy,

    #[error("no response for fence {fence}")]
    Timeout { fence: u16 },

    #[error("response of {len} words truncated to {capacity}")]
    ResponseTooLarge { len: usize, capacity: usize },

    #[error("remote party reset its ring state after a migration")]
    ChannelMigrated,

    #[error("firmware rejected the request (error {error:#06x}, hint {hint:#x})")]
    Remote { error: u16, hint: u16 },

    #[error("control call failed: {0}")]
    Mmio(String),

    #[error("invalid channel configuration: {0}")]
    Config(String),

    #[error("shared memory allocation failed: {0}")]
    OutOfMemory(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Malformed, unsolicited or unsupported traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} words is shorter than the CTB and HXG headers")]
    ShortFrame(usize),

    #[error("unknown frame format {0}")]
    UnknownFormat(u8),

    #[error("frame claims host origin")]
    HostOrigin,

    #[error(transparent)]
    Hxg(#[from] HxgDecodeError),

    #[error("unexpected HXG message type {0:?}")]
    UnexpectedType(fwct_abi::HxgType),

    #[error("unsolicited response for fence {fence}")]
    UnsolicitedResponse { fence: u16 },

    #[error("no handler for action {0:#06x}")]
    UnknownAction(u16),

    #[error("payload of {len} words exceeds the {max}-word frame limit")]
    FrameTooLarge { len: usize, max: usize },
}
