//! Request/response correlation.
//!
//! Every blocking send owns a [`RequestSlot`]; the registry only holds a `Weak` link to it so a
//! sender that gives up (timeout, disable) never leaves a dangling completion target behind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fwct_abi::hxg::is_firmware_origin;
use fwct_abi::{HxgHeader, HxgType};

use crate::error::{CtError, ProtocolError};
use crate::lock;

/// Number of recent sends remembered for diagnostics.
pub const SEND_HISTORY_LEN: usize = 16;

/// One H2G frame as remembered by the send history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRecord {
    pub fence: u16,
    pub action: u16,
    /// Sent as a fast request, i.e. no response was expected.
    pub fast: bool,
}

#[derive(Debug, Default)]
struct SendHistory {
    entries: VecDeque<SentRecord>,
}

impl SendHistory {
    fn record(&mut self, record: SentRecord) {
        if self.entries.len() == SEND_HISTORY_LEN {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    fn find(&self, fence: u16) -> Option<SentRecord> {
        self.entries.iter().rev().find(|r| r.fence == fence).copied()
    }
}

#[derive(Debug)]
struct Response {
    words: Vec<u32>,
    /// `None` when the sender does not want the payload.
    capacity: Option<usize>,
}

/// A blocking request waiting for its response.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    fence: u16,
    action: u16,
    /// HXG header of the response; zero while pending.
    status: AtomicU32,
    response: Mutex<Response>,
    cond: Condvar,
}

impl RequestSlot {
    /// `capacity` is the response payload the caller can accept, in words. With `None` any
    /// payload is dropped without being reported as truncated.
    pub fn new(fence: u16, action: u16, capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            fence,
            action,
            status: AtomicU32::new(0),
            response: Mutex::new(Response {
                words: Vec::new(),
                capacity,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn fence(&self) -> u16 {
        self.fence
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Store the response and wake the sender.
    ///
    /// The payload is truncated to the slot's capacity; truncation is reported after the slot
    /// has been completed.
    pub fn complete(&self, hxg: u32, payload: &[u32]) -> Result<(), CtError> {
        let mut response = lock(&self.response);
        let capacity = response.capacity;
        let copied = payload.len().min(capacity.unwrap_or(0));
        response.words.clear();
        response.words.extend_from_slice(&payload[..copied]);
        self.status.store(hxg, Ordering::Release);
        self.cond.notify_all();

        match capacity {
            Some(capacity) if copied < payload.len() => Err(CtError::ResponseTooLarge {
                len: payload.len(),
                capacity,
            }),
            _ => Ok(()),
        }
    }

    /// Return a BUSY slot to pending so the final response can complete it.
    ///
    /// Fails if the final response already replaced `busy`.
    pub fn rearm(&self, busy: u32) -> bool {
        self.status
            .compare_exchange(busy, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wake the sender without completing, so it re-checks the channel state.
    pub fn wake(&self) {
        let _response = lock(&self.response);
        self.cond.notify_all();
    }

    /// Copy the stored payload into `out`, returning the number of words copied.
    pub fn take_response(&self, out: &mut [u32]) -> usize {
        let response = lock(&self.response);
        let len = response.words.len().min(out.len());
        out[..len].copy_from_slice(&response.words[..len]);
        len
    }

    /// Wait for a firmware-origin status word.
    ///
    /// Polls for `spin` first, then sleeps on the condition variable for up to `timeout`.
    /// `live` is re-checked before every look at the status; its error wins over a completed
    /// response.
    pub fn wait(
        &self,
        spin: Duration,
        timeout: Duration,
        live: impl Fn() -> Result<(), CtError>,
    ) -> Result<u32, CtError> {
        let spin_deadline = Instant::now() + spin;
        loop {
            live()?;
            let status = self.status();
            if is_firmware_origin(status) {
                return Ok(status);
            }
            if Instant::now() >= spin_deadline {
                break;
            }
            thread::yield_now();
        }

        let deadline = Instant::now() + timeout;
        let mut response = lock(&self.response);
        loop {
            live()?;
            let status = self.status();
            if is_firmware_origin(status) {
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    fence = self.fence,
                    action = format_args!("{:#06x}", self.action),
                    "timed out waiting for response"
                );
                return Err(CtError::Timeout { fence: self.fence });
            }
            response = match self.cond.wait_timeout(response, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// G2H credit taken by a non-blocking send and not yet returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeldCredit {
    pub fence: u16,
    pub words: u32,
}

#[derive(Debug, Default)]
struct RegistryInner {
    pending: Vec<Weak<RequestSlot>>,
    history: SendHistory,
    /// Outstanding non-blocking reservations, oldest first.
    held: VecDeque<HeldCredit>,
}

/// Pending blocking requests, held reply credit and the recent-send history.
#[derive(Debug, Default)]
pub(crate) struct RequestRegistry {
    inner: Mutex<RegistryInner>,
}

impl RequestRegistry {
    pub fn insert(&self, slot: &Arc<RequestSlot>) {
        lock(&self.inner).pending.push(Arc::downgrade(slot));
    }

    pub fn remove(&self, slot: &Arc<RequestSlot>) {
        let target = Arc::as_ptr(slot);
        lock(&self.inner)
            .pending
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != target);
    }

    pub fn is_pending(&self, fence: u16) -> bool {
        lock(&self.inner)
            .pending
            .iter()
            .filter_map(Weak::upgrade)
            .any(|slot| slot.fence == fence)
    }

    pub fn pending_fences(&self) -> Vec<u16> {
        lock(&self.inner)
            .pending
            .iter()
            .filter_map(Weak::upgrade)
            .map(|slot| slot.fence)
            .collect()
    }

    /// Remember credit reserved by the non-blocking send with `fence`.
    pub fn hold_credit(&self, fence: u16, words: u32) {
        lock(&self.inner).held.push_back(HeldCredit { fence, words });
    }

    /// Drop the reservation of a send whose frame never made it onto the ring.
    pub fn forget_credit(&self, fence: u16) -> Option<HeldCredit> {
        let mut inner = lock(&self.inner);
        let index = inner.held.iter().rposition(|held| held.fence == fence)?;
        inner.held.remove(index)
    }

    /// Settle the oldest outstanding reservation. The firmware answers fast requests in order,
    /// so the next credit-releasing event belongs to it.
    pub fn settle_credit(&self) -> Option<HeldCredit> {
        lock(&self.inner).held.pop_front()
    }

    /// Words of credit held by non-blocking sends.
    pub fn held_credit(&self) -> u32 {
        lock(&self.inner).held.iter().map(|held| held.words).sum()
    }

    pub fn clear_credit(&self) {
        lock(&self.inner).held.clear();
    }

    pub fn record_send(&self, record: SentRecord) {
        lock(&self.inner).history.record(record);
    }

    pub fn recent_sends(&self) -> Vec<SentRecord> {
        lock(&self.inner).history.entries.iter().copied().collect()
    }

    pub fn wake_all(&self) {
        let slots: Vec<_> = lock(&self.inner)
            .pending
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for slot in slots {
            slot.wake();
        }
    }

    /// Route a response frame to the request that used `fence`.
    pub fn complete(&self, fence: u16, hxg: u32, payload: &[u32]) -> Result<(), CtError> {
        let (slot, sent) = {
            let inner = lock(&self.inner);
            let slot = inner
                .pending
                .iter()
                .filter_map(Weak::upgrade)
                .find(|slot| slot.fence == fence);
            (slot, inner.history.find(fence))
        };

        if let Some(slot) = slot {
            return slot.complete(hxg, payload);
        }

        let ty = HxgHeader::decode(hxg).ok().map(|h| h.ty);
        match sent {
            Some(sent) if sent.fast && ty == Some(HxgType::ResponseFailure) => {
                let header = HxgHeader::decode(hxg).map_err(ProtocolError::from)?;
                tracing::error!(
                    fence,
                    action = format_args!("{:#06x}", sent.action),
                    error = format_args!("{:#06x}", header.error_code()),
                    hint = format_args!("{:#x}", header.hint()),
                    "fast request failed"
                );
                Ok(())
            }
            _ => {
                tracing::warn!(
                    fence,
                    hxg = format_args!("{hxg:#010x}"),
                    action = ?sent.map(|s| s.action),
                    pending = ?self.pending_fences(),
                    "unsolicited response"
                );
                Err(ProtocolError::UnsolicitedResponse { fence }.into())
            }
        }
    }
}
