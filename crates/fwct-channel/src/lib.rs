//! Host side of the firmware command transport.
//!
//! A [`Channel`] owns two circular transport buffers in one shared blob: H2G carries requests to
//! the firmware, G2H carries responses and events back. Blocking sends correlate replies by fence,
//! non-blocking sends hold G2H credit until their answer arrives as an event, and inbound events
//! are dispatched either inline on the interrupt path or on a deferred worker.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
mod flow;
pub mod loopback;
pub mod port;
mod request;
pub mod ring;
pub mod shmem;
mod stall;

pub use channel::{Channel, ChannelInfo, CtbInfo, WeakChannel};
pub use config::{ChannelConfig, DeferredDispatch};
pub use dispatch::{DeferredHandler, EventHandler, ImmediateHandler, IncomingMessage};
pub use error::{CtError, ProtocolError};
pub use loopback::{LoopbackFirmware, PeerRing, Reply, Request};
pub use port::{FirmwarePort, MmioError};
pub use request::{SentRecord, SEND_HISTORY_LEN};
pub use shmem::{AllocError, HeapAllocator, SharedBlob, SharedMemoryAllocator};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
