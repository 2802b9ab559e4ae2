//! Shared memory layout contract for the command transport.
//!
//! The host allocates one contiguous blob and splits it into:
//!
//! - the H2G control descriptor,
//! - the G2H control descriptor,
//! - the H2G command array,
//! - the G2H command array.
//!
//! Descriptors sit in fixed [`DESC_SLOT_BYTES`] slots so that the command arrays start on a
//! well-aligned boundary. Command arrays are measured in 32-bit words on the wire.

use core::fmt;

use bitflags::bitflags;

/// Size of one 32-bit word in the command arrays.
pub const WORD_BYTES: usize = 4;

/// Bytes actually used by a control descriptor.
pub const DESC_BYTES: usize = 64;

/// Bytes reserved for each descriptor inside the blob.
pub const DESC_SLOT_BYTES: usize = 2048;

/// Default H2G command array size.
pub const DEFAULT_H2G_BYTES: usize = 4096;

/// Default G2H command array size. Four times the H2G size to absorb bursts of replies and
/// unsolicited notifications.
pub const DEFAULT_G2H_BYTES: usize = 4 * DEFAULT_H2G_BYTES;

/// Word indices inside a control descriptor.
pub mod desc {
    pub const HEAD: usize = 0;
    pub const TAIL: usize = 1;
    pub const STATUS: usize = 2;
    pub const WORDS: usize = super::DESC_BYTES / super::WORD_BYTES;
}

bitflags! {
    /// `status` word of a control descriptor.
    ///
    /// Either side may set error bits; the host treats any set bit other than
    /// [`DescStatus::MIGRATED`] as permanent corruption.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescStatus: u32 {
        /// Local and shared copies of head/tail disagree.
        const MISMATCH = 1 << 0;
        /// A frame claimed more words than were available.
        const UNDERFLOW = 1 << 1;
        /// head or tail pointed outside the command array.
        const OVERFLOW = 1 << 2;
        /// Reserved bit observed set.
        const UNUSED = 1 << 3;
        /// The remote party was migrated and its view of the rings was reset.
        const MIGRATED = 1 << 31;
    }
}

impl DescStatus {
    /// Bits that mean the ring can no longer be trusted.
    pub fn corruption_bits(self) -> Self {
        self.difference(Self::MIGRATED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset_bytes: usize,
    pub len_bytes: usize,
}

impl Region {
    pub const fn offset_words(&self) -> usize {
        self.offset_bytes / WORD_BYTES
    }

    pub const fn len_words(&self) -> usize {
        self.len_bytes / WORD_BYTES
    }

    pub const fn end_bytes(&self) -> usize {
        self.offset_bytes + self.len_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// A command array size was zero, not a power of two, or not word aligned.
    BadBufferSize(usize),
    /// A command array exceeds what the 32-bit size registration can express.
    BufferTooLarge(usize),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::BadBufferSize(size) => {
                write!(f, "command buffer size {size} must be a word-aligned power of two")
            }
            LayoutError::BufferTooLarge(size) => {
                write!(f, "command buffer size {size} does not fit in 32 bits")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// Placement of the four regions inside the shared blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLayout {
    pub h2g_desc: Region,
    pub g2h_desc: Region,
    pub h2g_cmds: Region,
    pub g2h_cmds: Region,
    pub total_bytes: usize,
}

impl BlobLayout {
    /// Compute the layout for the given command array sizes (bytes).
    pub fn new(h2g_bytes: usize, g2h_bytes: usize) -> Result<Self, LayoutError> {
        validate_buffer_size(h2g_bytes)?;
        validate_buffer_size(g2h_bytes)?;
        Ok(Self::place(h2g_bytes, g2h_bytes))
    }

    const fn place(h2g_bytes: usize, g2h_bytes: usize) -> Self {
        let h2g_desc = Region {
            offset_bytes: 0,
            len_bytes: DESC_BYTES,
        };
        let g2h_desc = Region {
            offset_bytes: DESC_SLOT_BYTES,
            len_bytes: DESC_BYTES,
        };
        let h2g_cmds = Region {
            offset_bytes: 2 * DESC_SLOT_BYTES,
            len_bytes: h2g_bytes,
        };
        let g2h_cmds = Region {
            offset_bytes: h2g_cmds.end_bytes(),
            len_bytes: g2h_bytes,
        };

        Self {
            h2g_desc,
            g2h_desc,
            h2g_cmds,
            g2h_cmds,
            total_bytes: g2h_cmds.end_bytes(),
        }
    }
}

impl Default for BlobLayout {
    fn default() -> Self {
        Self::place(DEFAULT_H2G_BYTES, DEFAULT_G2H_BYTES)
    }
}

fn validate_buffer_size(bytes: usize) -> Result<(), LayoutError> {
    if bytes == 0 || !bytes.is_power_of_two() || bytes % WORD_BYTES != 0 {
        return Err(LayoutError::BadBufferSize(bytes));
    }
    if u32::try_from(bytes).is_err() {
        return Err(LayoutError::BufferTooLarge(bytes));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_layout_places_descriptors_first() {
        let layout = BlobLayout::default();
        assert_eq!(layout.h2g_desc.offset_bytes, 0);
        assert_eq!(layout.g2h_desc.offset_bytes, 2048);
        assert_eq!(layout.h2g_cmds.offset_bytes, 4096);
        assert_eq!(layout.g2h_cmds.offset_bytes, 4096 + 4096);
        assert_eq!(layout.total_bytes, 4096 + 4096 + 16384);
        assert_eq!(layout.g2h_cmds.len_words(), 4096);
    }

    #[test]
    fn rejects_non_power_of_two_buffers() {
        assert_eq!(
            BlobLayout::new(3000, 4096),
            Err(LayoutError::BadBufferSize(3000))
        );
        assert_eq!(BlobLayout::new(4096, 0), Err(LayoutError::BadBufferSize(0)));
        assert_eq!(BlobLayout::new(2, 4096), Err(LayoutError::BadBufferSize(2)));
    }

    #[test]
    fn migrated_is_not_a_corruption_bit() {
        let status = DescStatus::MIGRATED | DescStatus::OVERFLOW;
        assert_eq!(status.corruption_bits(), DescStatus::OVERFLOW);
        assert!(DescStatus::MIGRATED.corruption_bits().is_empty());
    }

    #[test]
    fn descriptor_fits_its_slot() {
        assert!(DESC_BYTES <= DESC_SLOT_BYTES);
        assert_eq!(desc::WORDS, 16);
        assert!(desc::STATUS < desc::WORDS);
    }
}
