//! Host-side firmware command transport.
//!
//! [`abi`] holds the wire format shared with the firmware; [`channel`] holds the transport itself.

pub use fwct_abi as abi;
pub use fwct_channel as channel;

pub use fwct_channel::{
    Channel, ChannelConfig, CtError, DeferredDispatch, EventHandler, FirmwarePort,
    IncomingMessage, SharedMemoryAllocator,
};
