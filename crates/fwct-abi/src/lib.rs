//! Wire format of the host ↔ firmware command transport.
//!
//! Everything in this crate is plain data: word layouts, bit-field helpers and constants shared by
//! the host-side channel and any firmware model. The transport itself lives in `fwct-channel`.
//!
//! - [`layout`]: placement of the two control descriptors and two command arrays inside the
//!   shared blob.
//! - [`ctb`]: the per-frame CTB header word (fence, format, length).
//! - [`hxg`]: the HXG header word carried as the first word of every frame payload.
//! - [`action`]: well-known action codes.
//! - [`mmio`]: self-configuration messages sent outside the ring during the enable handshake.
#![forbid(unsafe_code)]

pub mod action;
pub mod ctb;
pub mod hxg;
pub mod layout;
pub mod mmio;

pub use ctb::{CtbHeader, CTB_HDR_LEN, CTB_MSG_MAX_LEN, CTB_FORMAT_HXG, MAX_PAYLOAD_WORDS};
pub use hxg::{HxgDecodeError, HxgHeader, HxgOrigin, HxgType, HXG_MSG_MIN_LEN};
pub use layout::{BlobLayout, DescStatus, LayoutError, Region};
