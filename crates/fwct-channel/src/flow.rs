//! Flow control.
//!
//! H2G space is a cache of what the firmware has consumed: the fast path trusts it, the slow path
//! re-reads the shared head. G2H space is a credit pool: every outstanding request holds the words
//! its reply may occupy so the firmware can never be forced to drop a response for lack of room.

use std::sync::atomic::Ordering;

use fwct_abi::DescStatus;

use crate::error::CtError;
use crate::ring::{circ_space, Ctb, Cursor};

impl Ctb {
    /// Whether `len` words can be written at `cursor.tail`.
    ///
    /// Refreshes the cached space from the shared head only when the cache says no.
    pub fn has_room(&self, cursor: &Cursor, len: u32) -> Result<bool, CtError> {
        if self.space() >= len {
            return Ok(true);
        }

        let head = self.ring().head();
        if head >= self.size() {
            return Err(self.corrupted(cursor, DescStatus::OVERFLOW));
        }

        let space = circ_space(head, cursor.tail, self.size()).saturating_sub(self.reserved());
        self.space.store(space, Ordering::Release);
        Ok(space >= len)
    }

    /// Whether `len` words of reply credit are available.
    pub fn has_credit(&self, len: u32) -> bool {
        self.space() >= len
    }

    /// Take `len` words of reply credit. The caller checked [`Ctb::has_credit`] under the
    /// sender lock.
    pub fn reserve_credit(&self, len: u32) {
        let prev = self.space.fetch_sub(len, Ordering::AcqRel);
        debug_assert!(prev >= len, "credit underflow: {prev} < {len}");
    }

    /// Return `len` words of reply credit.
    ///
    /// Credit never grows past the initial pool; an excess release (an event marked as
    /// credit-releasing that answered nothing) is logged and dropped.
    pub fn release_credit(&self, len: u32) {
        let limit = self.capacity().saturating_sub(self.reserved());
        let prev = self
            .space
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |space| {
                Some(space.saturating_add(len).min(limit))
            })
            .unwrap_or_else(|space| space);
        if prev.saturating_add(len) > limit {
            tracing::warn!(
                direction = self.direction().as_str(),
                released = len,
                space = prev,
                limit,
                "released more credit than was reserved"
            );
        }
    }
}
