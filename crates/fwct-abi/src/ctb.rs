//! CTB frame header.
//!
//! Every frame in either command array starts with one header word:
//!
//! ```text
//!  31            16 15         8 7          0
//! +----------------+------------+------------+
//! |     fence      |   format   | num_dwords |
//! +----------------+------------+------------+
//! ```
//!
//! `num_dwords` counts the words *after* the header (the HXG header plus payload), so the total
//! frame length is `num_dwords + CTB_HDR_LEN`.

use crate::hxg::HXG_MSG_MIN_LEN;

/// Length of the CTB header in words.
pub const CTB_HDR_LEN: u32 = 1;

/// Largest frame (header included) the protocol allows, in words.
pub const CTB_MSG_MAX_LEN: u32 = 256;

/// Smallest valid frame: CTB header plus HXG header.
pub const CTB_MSG_MIN_LEN: u32 = CTB_HDR_LEN + HXG_MSG_MIN_LEN;

/// Largest action payload (words after the HXG header) a single frame can carry.
pub const MAX_PAYLOAD_WORDS: usize = (CTB_MSG_MAX_LEN - CTB_MSG_MIN_LEN) as usize;

/// `format` value for HXG-formatted frames, the only format currently defined.
pub const CTB_FORMAT_HXG: u8 = 0;

const FENCE_SHIFT: u32 = 16;
const FORMAT_SHIFT: u32 = 8;
const FORMAT_MASK: u32 = 0xff;
const NUM_DWORDS_MASK: u32 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtbHeader {
    pub fence: u16,
    pub format: u8,
    pub num_dwords: u8,
}

impl CtbHeader {
    /// Header for an HXG frame carrying `payload_words` words after the HXG header.
    ///
    /// Returns `None` when the frame would exceed [`CTB_MSG_MAX_LEN`].
    pub fn hxg(fence: u16, payload_words: usize) -> Option<Self> {
        if payload_words > MAX_PAYLOAD_WORDS {
            return None;
        }
        let num_dwords = u8::try_from(payload_words + HXG_MSG_MIN_LEN as usize).ok()?;
        Some(Self {
            fence,
            format: CTB_FORMAT_HXG,
            num_dwords,
        })
    }

    pub const fn encode(self) -> u32 {
        ((self.fence as u32) << FENCE_SHIFT)
            | ((self.format as u32 & FORMAT_MASK) << FORMAT_SHIFT)
            | (self.num_dwords as u32 & NUM_DWORDS_MASK)
    }

    pub const fn decode(word: u32) -> Self {
        Self {
            fence: (word >> FENCE_SHIFT) as u16,
            format: ((word >> FORMAT_SHIFT) & FORMAT_MASK) as u8,
            num_dwords: (word & NUM_DWORDS_MASK) as u8,
        }
    }

    /// Total frame length in words, header included.
    pub const fn frame_len(self) -> u32 {
        self.num_dwords as u32 + CTB_HDR_LEN
    }
}

/// Frame length (words, both headers included) for an action payload of `payload_words`.
pub const fn frame_len_for_payload(payload_words: usize) -> u32 {
    CTB_MSG_MIN_LEN + payload_words as u32
}
