//! HXG message header.
//!
//! The HXG header is the first word after the CTB header in every frame, and also the first word of
//! every MMIO self-configuration message.
//!
//! ```text
//!  31  30    28 27                                0
//! +---+--------+-----------------------------------+
//! | O |  type  |              data0                |
//! +---+--------+-----------------------------------+
//! ```
//!
//! For requests and events `data0` splits into a 12-bit data field (27..16) and a 16-bit action
//! code (15..0). Failure responses carry a 12-bit hint and a 16-bit error code in the same
//! positions; retry responses carry a 28-bit reason.

use core::fmt;

/// Length of the HXG header in words.
pub const HXG_MSG_MIN_LEN: u32 = 1;

const ORIGIN_SHIFT: u32 = 31;
const TYPE_SHIFT: u32 = 28;
const TYPE_MASK: u32 = 0x7;
const DATA0_MASK: u32 = 0x0fff_ffff;
const ACTION_MASK: u32 = 0xffff;
const AUX_SHIFT: u32 = 16;
const AUX_MASK: u32 = 0xfff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HxgOrigin {
    Host,
    Firmware,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HxgType {
    Request = 0,
    Event = 1,
    FastRequest = 2,
    NoResponseBusy = 3,
    NoResponseRetry = 5,
    ResponseFailure = 6,
    ResponseSuccess = 7,
}

impl HxgType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => HxgType::Request,
            1 => HxgType::Event,
            2 => HxgType::FastRequest,
            3 => HxgType::NoResponseBusy,
            5 => HxgType::NoResponseRetry,
            6 => HxgType::ResponseFailure,
            7 => HxgType::ResponseSuccess,
            _ => return None,
        })
    }

    /// Types routed to a pending request by fence.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            HxgType::ResponseSuccess
                | HxgType::ResponseFailure
                | HxgType::NoResponseRetry
                | HxgType::NoResponseBusy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HxgDecodeError {
    UnknownType(u8),
}

impl fmt::Display for HxgDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HxgDecodeError::UnknownType(ty) => write!(f, "unknown HXG type {ty}"),
        }
    }
}

impl std::error::Error for HxgDecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HxgHeader {
    pub origin: HxgOrigin,
    pub ty: HxgType,
    /// 28-bit type-specific field.
    pub data0: u32,
}

impl HxgHeader {
    pub fn request(action: u16) -> Self {
        Self::action_message(HxgOrigin::Host, HxgType::Request, action)
    }

    pub fn fast_request(action: u16) -> Self {
        Self::action_message(HxgOrigin::Host, HxgType::FastRequest, action)
    }

    pub fn event(action: u16) -> Self {
        Self::action_message(HxgOrigin::Firmware, HxgType::Event, action)
    }

    pub fn success(data0: u32) -> Self {
        Self {
            origin: HxgOrigin::Firmware,
            ty: HxgType::ResponseSuccess,
            data0: data0 & DATA0_MASK,
        }
    }

    pub fn failure(error: u16, hint: u16) -> Self {
        Self {
            origin: HxgOrigin::Firmware,
            ty: HxgType::ResponseFailure,
            data0: pack_aux(hint, error),
        }
    }

    pub fn retry(reason: u32) -> Self {
        Self {
            origin: HxgOrigin::Firmware,
            ty: HxgType::NoResponseRetry,
            data0: reason & DATA0_MASK,
        }
    }

    /// The firmware accepted the request but needs longer than usual to answer it.
    pub fn busy(reason: u32) -> Self {
        Self {
            origin: HxgOrigin::Firmware,
            ty: HxgType::NoResponseBusy,
            data0: reason & DATA0_MASK,
        }
    }

    fn action_message(origin: HxgOrigin, ty: HxgType, action: u16) -> Self {
        Self {
            origin,
            ty,
            data0: u32::from(action),
        }
    }

    pub fn encode(self) -> u32 {
        let origin = match self.origin {
            HxgOrigin::Host => 0,
            HxgOrigin::Firmware => 1,
        };
        (origin << ORIGIN_SHIFT)
            | ((self.ty as u32 & TYPE_MASK) << TYPE_SHIFT)
            | (self.data0 & DATA0_MASK)
    }

    pub fn decode(word: u32) -> Result<Self, HxgDecodeError> {
        let origin = if word >> ORIGIN_SHIFT != 0 {
            HxgOrigin::Firmware
        } else {
            HxgOrigin::Host
        };
        let bits = ((word >> TYPE_SHIFT) & TYPE_MASK) as u8;
        let ty = HxgType::from_bits(bits).ok_or(HxgDecodeError::UnknownType(bits))?;
        Ok(Self {
            origin,
            ty,
            data0: word & DATA0_MASK,
        })
    }

    /// Action code of a request or event.
    pub fn action(&self) -> u16 {
        (self.data0 & ACTION_MASK) as u16
    }

    /// Error code of a failure response.
    pub fn error_code(&self) -> u16 {
        (self.data0 & ACTION_MASK) as u16
    }

    /// Hint of a failure response.
    pub fn hint(&self) -> u16 {
        ((self.data0 >> AUX_SHIFT) & AUX_MASK) as u16
    }
}

/// Whether a status word written by the completion path came from the firmware.
///
/// Pending requests start with a zero status; the completion path stores the HXG header of the
/// response, whose origin bit is always set.
pub const fn is_firmware_origin(word: u32) -> bool {
    word >> ORIGIN_SHIFT != 0
}

fn pack_aux(aux: u16, code: u16) -> u32 {
    ((u32::from(aux) & AUX_MASK) << AUX_SHIFT) | u32::from(code)
}
