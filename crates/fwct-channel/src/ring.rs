//! Circular transport buffers.
//!
//! Each direction is a fixed array of 32-bit words plus a control descriptor in shared memory.
//! The writer of a direction owns `tail`, the reader owns `head`; neither side ever stores to the
//! other's field, so no lock is shared with the firmware. Frame words are copied with relaxed
//! stores and published by a `Release` store of the owned index; the other side pairs it with an
//! `Acquire` load.
//!
//! Ring sizes are powers of two (enforced by [`fwct_abi::BlobLayout`]), so wrap arithmetic is a
//! mask. One word is always left unused so that `head == tail` means empty.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fwct_abi::layout::{desc, Region, WORD_BYTES};
use fwct_abi::{CtbHeader, DescStatus};

use crate::error::CtError;
use crate::shmem::SharedBlob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host → firmware.
    H2g,
    /// Firmware → host.
    G2h,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::H2g => "H2G",
            Direction::G2h => "G2H",
        }
    }
}

/// Words queued between `head` and `tail`.
pub const fn circ_cnt(head: u32, tail: u32, size: u32) -> u32 {
    tail.wrapping_sub(head) & (size - 1)
}

/// Words a producer at `tail` may still write before reaching `head`.
pub const fn circ_space(head: u32, tail: u32, size: u32) -> u32 {
    head.wrapping_sub(tail).wrapping_sub(1) & (size - 1)
}

/// Typed view of one direction's descriptor and command array inside the blob.
#[derive(Debug, Clone)]
pub struct RingView {
    blob: Arc<SharedBlob>,
    desc: usize,
    cmds: usize,
    size: u32,
}

impl RingView {
    pub fn new(blob: Arc<SharedBlob>, desc: Region, cmds: Region) -> Self {
        debug_assert!(cmds.len_words().is_power_of_two());
        debug_assert!(cmds.end_bytes() <= blob.len_bytes());
        Self {
            blob,
            desc: desc.offset_words(),
            cmds: cmds.offset_words(),
            size: cmds.len_words() as u32,
        }
    }

    pub fn blob(&self) -> &Arc<SharedBlob> {
        &self.blob
    }

    /// Ring size in words.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn size_bytes(&self) -> u32 {
        self.size * WORD_BYTES as u32
    }

    pub fn desc_addr(&self) -> u64 {
        self.blob.addr_of(self.desc * WORD_BYTES)
    }

    pub fn cmds_addr(&self) -> u64 {
        self.blob.addr_of(self.cmds * WORD_BYTES)
    }

    pub fn head(&self) -> u32 {
        self.blob.load(self.desc + desc::HEAD, Ordering::Acquire)
    }

    pub fn tail(&self) -> u32 {
        self.blob.load(self.desc + desc::TAIL, Ordering::Acquire)
    }

    pub fn status(&self) -> DescStatus {
        DescStatus::from_bits_retain(self.blob.load(self.desc + desc::STATUS, Ordering::Acquire))
    }

    pub fn publish_head(&self, head: u32) {
        self.blob.store(self.desc + desc::HEAD, head, Ordering::Release);
    }

    pub fn publish_tail(&self, tail: u32) {
        self.blob.store(self.desc + desc::TAIL, tail, Ordering::Release);
    }

    pub fn raise_status(&self, bits: DescStatus) {
        self.blob
            .fetch_or(self.desc + desc::STATUS, bits.bits(), Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: DescStatus) {
        self.blob
            .fetch_and(self.desc + desc::STATUS, !bits.bits(), Ordering::AcqRel);
    }

    /// Zero the descriptor.
    pub fn reset(&self) {
        self.blob.fill(self.desc, desc::WORDS, 0);
        // Make the zeroed descriptor visible before any later publication.
        self.blob.store(self.desc + desc::HEAD, 0, Ordering::Release);
    }

    pub fn word(&self, index: u32) -> u32 {
        debug_assert!(index < self.size);
        self.blob.load(self.cmds + index as usize, Ordering::Relaxed)
    }

    pub fn set_word(&self, index: u32, value: u32) {
        debug_assert!(index < self.size);
        self.blob
            .store(self.cmds + index as usize, value, Ordering::Relaxed);
    }
}

/// Host-local copies of the ring indices. Guarded by the per-direction lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub head: u32,
    pub tail: u32,
}

/// Host side of one circular transport buffer.
#[derive(Debug)]
pub struct Ctb {
    direction: Direction,
    ring: RingView,
    resv_space: u32,
    /// H2G: cached free words. G2H: reply credits not yet reserved.
    pub(crate) space: AtomicU32,
    broken: AtomicBool,
    tolerate_migration: bool,
}

impl Ctb {
    /// `resv_space` words are withheld from every availability computation.
    pub fn new(
        direction: Direction,
        ring: RingView,
        resv_space: u32,
        tolerate_migration: bool,
    ) -> Self {
        let ctb = Self {
            direction,
            ring,
            resv_space,
            space: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            tolerate_migration,
        };
        ctb.space.store(ctb.initial_space(), Ordering::Release);
        ctb
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn ring(&self) -> &RingView {
        &self.ring
    }

    pub fn size(&self) -> u32 {
        self.ring.size()
    }

    /// Words that can be queued at once.
    pub fn capacity(&self) -> u32 {
        self.ring.size() - 1
    }

    pub fn reserved(&self) -> u32 {
        self.resv_space
    }

    pub fn space(&self) -> u32 {
        self.space.load(Ordering::Acquire)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Returns `true` if this call transitioned the buffer to broken.
    pub(crate) fn mark_broken(&self) -> bool {
        !self.broken.swap(true, Ordering::AcqRel)
    }

    fn initial_space(&self) -> u32 {
        self.capacity().saturating_sub(self.resv_space)
    }

    /// Words currently queued, as seen from the host's side of this direction.
    pub fn used(&self, cursor: &Cursor) -> u32 {
        match self.direction {
            Direction::H2g => circ_cnt(self.ring.head(), cursor.tail, self.size()),
            Direction::G2h => circ_cnt(cursor.head, self.ring.tail(), self.size()),
        }
    }

    /// Empty the ring and clear the broken flag. Called on every enable.
    pub fn reset(&self, cursor: &mut Cursor) {
        *cursor = Cursor::default();
        self.ring.reset();
        self.space.store(self.initial_space(), Ordering::Release);
        self.broken.store(false, Ordering::Release);
    }

    fn check_status(&self, cursor: &Cursor) -> Result<(), CtError> {
        let status = self.ring.status();
        if status.is_empty() {
            return Ok(());
        }
        if status.corruption_bits().is_empty() && self.tolerate_migration {
            tracing::warn!(
                direction = self.direction.as_str(),
                status = status.bits(),
                "remote signalled migration"
            );
            return Err(CtError::ChannelMigrated);
        }
        Err(self.corrupted(cursor, DescStatus::empty()))
    }

    pub(crate) fn corrupted(&self, cursor: &Cursor, bits: DescStatus) -> CtError {
        if !bits.is_empty() {
            self.ring.raise_status(bits);
        }
        if self.mark_broken() {
            tracing::error!(
                direction = self.direction.as_str(),
                head = self.ring.head(),
                tail = self.ring.tail(),
                status = self.ring.status().bits(),
                local_head = cursor.head,
                local_tail = cursor.tail,
                "corrupted descriptor"
            );
        }
        CtError::Broken
    }

    /// Copy one frame into the ring and publish the new tail.
    ///
    /// The caller must already have checked space with [`Ctb::has_room`].
    pub fn write(&self, cursor: &mut Cursor, frame: &[u32]) -> Result<(), CtError> {
        if self.is_broken() {
            return Err(CtError::Broken);
        }
        self.check_status(cursor)?;

        let size = self.size();
        if self.ring.tail() != cursor.tail {
            return Err(self.corrupted(cursor, DescStatus::MISMATCH));
        }
        if self.ring.head() >= size {
            return Err(self.corrupted(cursor, DescStatus::OVERFLOW));
        }

        let len = frame.len() as u32;
        if len > self.space() {
            debug_assert!(false, "write without room: {len} > {}", self.space());
            return Err(CtError::Busy);
        }

        let mut tail = cursor.tail;
        for &word in frame {
            self.ring.set_word(tail, word);
            tail = (tail + 1) & (size - 1);
        }

        cursor.tail = tail;
        self.space.fetch_sub(len, Ordering::AcqRel);
        self.ring.publish_tail(tail);
        Ok(())
    }

    /// Copy the next complete frame out of the ring, if any, and publish the new head.
    pub fn read(&self, cursor: &mut Cursor) -> Result<Option<Vec<u32>>, CtError> {
        if self.is_broken() {
            return Err(CtError::Broken);
        }
        self.check_status(cursor)?;

        let size = self.size();
        if self.ring.head() != cursor.head {
            return Err(self.corrupted(cursor, DescStatus::MISMATCH));
        }
        let tail = self.ring.tail();
        if tail >= size {
            return Err(self.corrupted(cursor, DescStatus::OVERFLOW));
        }

        let available = circ_cnt(cursor.head, tail, size);
        if available == 0 {
            return Ok(None);
        }

        let header = CtbHeader::decode(self.ring.word(cursor.head));
        let len = header.frame_len();
        if len > available {
            tracing::error!(
                direction = self.direction.as_str(),
                len,
                available,
                header = format_args!("{:#010x}", self.ring.word(cursor.head)),
                "incomplete message"
            );
            return Err(self.corrupted(cursor, DescStatus::UNDERFLOW));
        }

        let mut head = cursor.head;
        let mut frame = Vec::with_capacity(len as usize);
        for _ in 0..len {
            frame.push(self.ring.word(head));
            head = (head + 1) & (size - 1);
        }

        cursor.head = head;
        self.ring.publish_head(head);
        Ok(Some(frame))
    }
}
