//! The command transport channel.
//!
//! [`Channel`] is a cheap, clonable handle to the shared [`ChannelState`]. Senders serialize on
//! the H2G lock only for the room check, fence assignment and frame copy; they wait for replies
//! on their own [`RequestSlot`] with no channel lock held. The receive side is driven by
//! [`Channel::handle_interrupt`], which may run on any thread but never concurrently with itself.
//!
//! Lock order: H2G → G2H, and H2G → pending registry → request slot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fwct_abi::ctb::{frame_len_for_payload, CTB_MSG_MIN_LEN};
use fwct_abi::layout::WORD_BYTES;
use fwct_abi::mmio::{self, KLV_G2H_CTB_ADDR, KLV_G2H_CTB_DESCRIPTOR_ADDR, KLV_G2H_CTB_SIZE};
use fwct_abi::mmio::{KLV_H2G_CTB_ADDR, KLV_H2G_CTB_DESCRIPTOR_ADDR, KLV_H2G_CTB_SIZE};
use fwct_abi::{
    BlobLayout, CtbHeader, DescStatus, HxgHeader, HxgOrigin, HxgType, CTB_FORMAT_HXG,
    CTB_MSG_MAX_LEN, MAX_PAYLOAD_WORDS,
};

use crate::config::{ChannelConfig, DeferredDispatch};
use crate::dispatch::{
    DeferredWorker, EventHandler, HandlerKind, HandlerTable, IncomingMessage, IncomingQueue,
};
use crate::error::{CtError, ProtocolError};
use crate::lock;
use crate::port::FirmwarePort;
use crate::request::{RequestRegistry, RequestSlot, SentRecord};
use crate::ring::{Ctb, Cursor, Direction, RingView};
use crate::shmem::{SharedBlob, SharedMemoryAllocator};
use crate::stall::StallTimer;

/// A RETRY loop longer than this many rounds is reported at warn level.
const RETRY_WARN_INTERVAL: u32 = 64;

#[derive(Debug, Default)]
struct SendState {
    cursor: Cursor,
    last_fence: u16,
    stall: StallTimer,
}

/// Everything shared between senders, the interrupt path and the deferred worker.
pub(crate) struct ChannelState {
    config: ChannelConfig,
    port: Arc<dyn FirmwarePort>,
    layout: BlobLayout,
    blob: Arc<SharedBlob>,
    h2g: Ctb,
    g2h: Ctb,
    /// H2G lock.
    send: Mutex<SendState>,
    /// G2H lock.
    recv: Mutex<Cursor>,
    requests: RequestRegistry,
    handlers: HandlerTable,
    incoming: IncomingQueue,
    worker: DeferredWorker,
    enabled: AtomicBool,
    irq_requests: AtomicU32,
    irq_busy: AtomicBool,
    /// G2H credit held by every blocking send while it waits.
    reply_credit: u32,
    max_payload: usize,
}

/// Handle to a command transport channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelState>,
}

/// Non-owning handle, for callbacks that must not keep the channel alive.
#[derive(Clone, Debug, Default)]
pub struct WeakChannel {
    inner: Weak<ChannelState>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("base", &format_args!("{:#x}", self.inner.blob.base_addr()))
            .field("enabled", &self.is_enabled())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelState")
            .field("layout", &self.layout)
            .field("h2g", &self.h2g)
            .field("g2h", &self.g2h)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Allocate the shared blob and set up both rings. The channel starts disabled.
    pub fn init(
        config: ChannelConfig,
        allocator: &dyn SharedMemoryAllocator,
        port: Arc<dyn FirmwarePort>,
    ) -> Result<Self, CtError> {
        let layout = BlobLayout::new(config.h2g_bytes, config.g2h_bytes)
            .map_err(|err| CtError::Config(err.to_string()))?;

        let blob = allocator
            .allocate(layout.total_bytes)
            .map_err(|err| CtError::OutOfMemory(err.to_string()))?;
        if blob.len_bytes() < layout.total_bytes {
            return Err(CtError::OutOfMemory(format!(
                "allocator returned {} bytes, layout needs {}",
                blob.len_bytes(),
                layout.total_bytes
            )));
        }

        let resv = (config.g2h_reserved_bytes / WORD_BYTES) as u32;
        let h2g = Ctb::new(
            Direction::H2g,
            RingView::new(Arc::clone(&blob), layout.h2g_desc, layout.h2g_cmds),
            0,
            config.managed_guest,
        );
        let g2h = Ctb::new(
            Direction::G2h,
            RingView::new(Arc::clone(&blob), layout.g2h_desc, layout.g2h_cmds),
            resv,
            config.managed_guest,
        );

        if h2g.capacity() < CTB_MSG_MIN_LEN {
            return Err(CtError::Config(format!(
                "H2G ring of {} bytes cannot hold a frame",
                config.h2g_bytes
            )));
        }
        let credit_pool = g2h.capacity().saturating_sub(g2h.reserved());
        if credit_pool < CTB_MSG_MIN_LEN {
            return Err(CtError::Config(format!(
                "G2H reservation of {} bytes leaves no reply credit",
                config.g2h_reserved_bytes
            )));
        }

        let reply_credit = CTB_MSG_MAX_LEN.min(credit_pool);
        let max_payload = MAX_PAYLOAD_WORDS.min((h2g.capacity() - CTB_MSG_MIN_LEN) as usize);

        tracing::debug!(
            base = format_args!("{:#x}", blob.base_addr()),
            h2g_words = h2g.size(),
            g2h_words = g2h.size(),
            reply_credit,
            "CT initialized"
        );

        let dispatch = config.deferred_dispatch;
        let channel = Self {
            inner: Arc::new(ChannelState {
                config,
                port,
                layout,
                blob,
                h2g,
                g2h,
                send: Mutex::new(SendState::default()),
                recv: Mutex::new(Cursor::default()),
                requests: RequestRegistry::default(),
                handlers: HandlerTable::default(),
                incoming: IncomingQueue::default(),
                worker: DeferredWorker::default(),
                enabled: AtomicBool::new(false),
                irq_requests: AtomicU32::new(0),
                irq_busy: AtomicBool::new(false),
                reply_credit,
                max_payload,
            }),
        };

        if dispatch == DeferredDispatch::WorkerThread {
            channel.inner.worker.spawn(channel.downgrade())?;
        }
        Ok(channel)
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &BlobLayout {
        &self.inner.layout
    }

    pub fn blob(&self) -> &Arc<SharedBlob> {
        &self.inner.blob
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn is_broken(&self) -> bool {
        self.inner.h2g.is_broken() || self.inner.g2h.is_broken()
    }

    /// Largest payload (words after the HXG header) a single send accepts.
    pub fn max_payload_words(&self) -> usize {
        self.inner.max_payload
    }

    /// Reset both rings, register them with the firmware and open the channel.
    ///
    /// G2H is registered before H2G so the firmware always has somewhere to put replies.
    pub fn enable(&self) -> Result<(), CtError> {
        let st = &*self.inner;
        if self.is_enabled() {
            tracing::debug!("CT already enabled");
            return Ok(());
        }

        {
            let mut send = lock(&st.send);
            st.h2g.reset(&mut send.cursor);
            send.stall.clear();
        }
        st.g2h.reset(&mut lock(&st.recv));
        st.incoming.clear();
        st.requests.clear_credit();

        st.register(&st.g2h)?;
        st.register(&st.h2g)?;
        st.mmio(&mmio::control_ctb(true)).map_err(|err| {
            tracing::error!(error = %err, "failed to enable CT");
            err
        })?;

        lock(&st.send).stall.clear();
        st.enabled.store(true, Ordering::Release);
        tracing::info!(
            h2g = format_args!("{:#x}", st.h2g.ring().cmds_addr()),
            g2h = format_args!("{:#x}", st.g2h.ring().cmds_addr()),
            "CT enabled"
        );
        Ok(())
    }

    /// Close the channel. Waiting senders return [`CtError::NotEnabled`].
    pub fn disable(&self) {
        let st = &*self.inner;
        if !st.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        st.requests.wake_all();

        if st.port.is_running() {
            if let Err(err) = st.mmio(&mmio::control_ctb(false)) {
                tracing::warn!(error = %err, "failed to disable CT");
            }
        }
        tracing::info!("CT disabled");
    }

    /// Disable the channel and stop the deferred worker.
    pub fn fini(self) {
        self.disable();
        self.inner.worker.shutdown();
    }

    /// Register the handler for events carrying `action`, replacing any previous one.
    pub fn register_event_handler(&self, action: u16, handler: EventHandler) {
        if self.inner.handlers.register(action, handler).is_some() {
            tracing::debug!(action = format_args!("{action:#06x}"), "replaced event handler");
        }
    }

    /// Send a request and wait for its success response, discarding any payload.
    pub fn send(&self, action: u16, payload: &[u32]) -> Result<(), CtError> {
        self.send_recv(action, payload, None).map(drop)
    }

    /// Send a request and wait for its response.
    ///
    /// The response payload is copied into `out`; the return value is the number of bytes
    /// copied. A payload longer than `out` is truncated.
    pub fn send_with_reply(
        &self,
        action: u16,
        payload: &[u32],
        out: &mut [u32],
    ) -> Result<usize, CtError> {
        self.send_recv(action, payload, Some(out))
            .map(|words| words * WORD_BYTES)
    }

    /// Queue a fast request without waiting.
    ///
    /// `expected_reply_words` of G2H credit are held until an event registered with
    /// [`EventHandler::releasing_credit`] arrives; each such event returns the credit of the
    /// oldest outstanding non-blocking send, whatever its own length. Fails with [`CtError::Busy`] instead of
    /// waiting when either ring is short of space.
    pub fn send_non_blocking(
        &self,
        action: u16,
        payload: &[u32],
        expected_reply_words: u32,
    ) -> Result<(), CtError> {
        let st = &*self.inner;
        st.check_payload(payload)?;
        if expected_reply_words > st.reply_credit {
            return Err(ProtocolError::FrameTooLarge {
                len: expected_reply_words as usize,
                max: st.reply_credit as usize,
            }
            .into());
        }
        let frame_len = frame_len_for_payload(payload.len());

        let starved_g2h = {
            let mut send = lock(&st.send);
            st.check_live()?;
            if st.has_room(&mut send, frame_len, expected_reply_words)? {
                let fence = st.next_fence(&mut send);
                // The reply may be consumed as soon as the tail is published.
                if expected_reply_words > 0 {
                    st.g2h.reserve_credit(expected_reply_words);
                    st.requests.hold_credit(fence, expected_reply_words);
                }
                if let Err(err) = st.write_frame(
                    &mut send,
                    fence,
                    HxgHeader::fast_request(action),
                    payload,
                    true,
                ) {
                    if let Some(held) = st.requests.forget_credit(fence) {
                        st.g2h.release_credit(held.words);
                    }
                    return Err(err);
                }
                None
            } else {
                Some(!st.g2h.has_credit(expected_reply_words))
            }
        };

        match starved_g2h {
            None => {
                st.port.ring_doorbell();
                Ok(())
            }
            Some(starved) => {
                if starved {
                    // Draining G2H is the only thing that can return credit.
                    let _ = self.handle_interrupt();
                }
                Err(CtError::Busy)
            }
        }
    }

    /// Drain G2H. Called from the device interrupt.
    ///
    /// Responses complete their pending requests, immediate events run inline, and everything
    /// else is queued for the deferred worker. Concurrent calls coalesce: whoever is already
    /// draining loops once more instead of a second drain running in parallel.
    pub fn handle_interrupt(&self) -> Result<(), CtError> {
        let st = &*self.inner;
        st.irq_requests.fetch_add(1, Ordering::AcqRel);
        if st.irq_busy.swap(true, Ordering::Acquire) {
            return Ok(());
        }

        let mut result = Ok(());
        loop {
            st.irq_requests.store(0, Ordering::Release);
            let pass = st.receive_all();
            if result.is_ok() {
                result = pass;
            }
            st.irq_busy.store(false, Ordering::Release);
            if st.irq_requests.load(Ordering::Acquire) == 0
                || st.irq_busy.swap(true, Ordering::Acquire)
            {
                break;
            }
        }
        result
    }

    /// Run queued deferred events until the queue is observed empty. Returns how many were
    /// processed.
    ///
    /// Called by the worker thread, or by the owner when dispatch is
    /// [`DeferredDispatch::Manual`].
    pub fn run_deferred_work(&self) -> usize {
        self.inner.worker.take_scheduled();
        let mut processed = 0;
        loop {
            let (msg, empty) = self.inner.incoming.pop();
            if let Some(msg) = msg {
                processed += 1;
                if let Err(err) = self.dispatch_deferred(&msg) {
                    tracing::error!(
                        action = format_args!("{:#06x}", msg.action()),
                        error = %err,
                        "failed to process G2H event"
                    );
                }
            }
            if empty {
                return processed;
            }
        }
    }

    /// Whether deferred work has been scheduled but not yet run.
    pub fn has_deferred_work(&self) -> bool {
        self.inner.worker.is_scheduled()
    }

    /// Point-in-time view of both rings and the request bookkeeping.
    pub fn info(&self) -> ChannelInfo {
        let send = lock(&self.inner.send);
        self.inner.snapshot(&send)
    }

    fn dispatch_deferred(&self, msg: &IncomingMessage) -> Result<(), CtError> {
        match self.inner.handlers.get(msg.action()).map(|h| h.kind) {
            Some(HandlerKind::Deferred(handler)) => handler.handle(self, msg),
            Some(HandlerKind::Immediate(handler)) => handler.handle_immediate(msg),
            None => Err(ProtocolError::UnknownAction(msg.action()).into()),
        }
    }

    /// Blocking send. Returns the number of response words copied into `out`; without `out` the
    /// response payload is discarded.
    fn send_recv(
        &self,
        action: u16,
        payload: &[u32],
        mut out: Option<&mut [u32]>,
    ) -> Result<usize, CtError> {
        let st = &*self.inner;
        st.check_payload(payload)?;
        let frame_len = frame_len_for_payload(payload.len());

        let mut retries = 0u32;
        loop {
            let capacity = out.as_deref().map(<[u32]>::len);
            let slot = self.write_request(action, payload, frame_len, capacity)?;
            st.port.ring_doorbell();

            let outcome = st.wait_for_reply(&slot);
            st.g2h.release_credit(st.reply_credit);
            st.requests.remove(&slot);

            let header = HxgHeader::decode(outcome?).map_err(ProtocolError::from)?;
            match header.ty {
                HxgType::ResponseSuccess => {
                    return Ok(out.as_deref_mut().map_or(0, |out| slot.take_response(out)));
                }
                HxgType::ResponseFailure => {
                    tracing::debug!(
                        fence = slot.fence(),
                        action = format_args!("{action:#06x}"),
                        error = format_args!("{:#06x}", header.error_code()),
                        hint = format_args!("{:#x}", header.hint()),
                        "request failed"
                    );
                    return Err(CtError::Remote {
                        error: header.error_code(),
                        hint: header.hint(),
                    });
                }
                HxgType::NoResponseRetry => {
                    retries += 1;
                    tracing::debug!(
                        fence = slot.fence(),
                        action = format_args!("{action:#06x}"),
                        reason = header.data0,
                        retries,
                        "firmware asked to retry"
                    );
                    if retries % RETRY_WARN_INTERVAL == 0 {
                        tracing::warn!(
                            action = format_args!("{action:#06x}"),
                            retries,
                            "request keeps being retried"
                        );
                    }
                }
                other => return Err(ProtocolError::UnexpectedType(other).into()),
            }
        }
    }

    /// Wait for room, then register a pending request and write its frame.
    fn write_request(
        &self,
        action: u16,
        payload: &[u32],
        frame_len: u32,
        capacity: Option<usize>,
    ) -> Result<Arc<RequestSlot>, CtError> {
        let st = &*self.inner;
        let mut backoff = st.config.backoff_min;
        loop {
            {
                let mut send = lock(&st.send);
                st.check_live()?;
                if st.has_room(&mut send, frame_len, st.reply_credit)? {
                    let fence = st.next_fence(&mut send);
                    let slot = RequestSlot::new(fence, action, capacity);
                    st.requests.insert(&slot);
                    if let Err(err) = st.write_frame(
                        &mut send,
                        fence,
                        HxgHeader::request(action),
                        payload,
                        false,
                    ) {
                        st.requests.remove(&slot);
                        return Err(err);
                    }
                    st.g2h.reserve_credit(st.reply_credit);
                    return Ok(slot);
                }
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(st.config.backoff_max);
        }
    }
}

impl ChannelState {
    fn check_live(&self) -> Result<(), CtError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(CtError::NotEnabled);
        }
        if self.h2g.is_broken() || self.g2h.is_broken() {
            return Err(CtError::Broken);
        }
        Ok(())
    }

    fn check_payload(&self, payload: &[u32]) -> Result<(), CtError> {
        if payload.len() > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: self.max_payload,
            }
            .into());
        }
        Ok(())
    }

    /// Wake every waiter when an operation reports the channel broken.
    fn on_error(&self, err: CtError) -> CtError {
        if err == CtError::Broken {
            self.requests.wake_all();
        }
        err
    }

    /// Check both directions for room, driving the stall timer.
    fn has_room(
        &self,
        send: &mut SendState,
        h2g_words: u32,
        g2h_credit: u32,
    ) -> Result<bool, CtError> {
        let h2g_ok = self
            .h2g
            .has_room(&send.cursor, h2g_words)
            .map_err(|err| self.on_error(err))?;
        let g2h_ok = self.g2h.has_credit(g2h_credit);
        if h2g_ok && g2h_ok {
            send.stall.clear();
            return Ok(true);
        }

        let now = Instant::now();
        send.stall.start(now);
        if let Some(stalled) = send.stall.expired(now, self.config.stall_timeout) {
            return Err(self.declare_deadlock(send, stalled, h2g_ok, g2h_ok));
        }
        Ok(false)
    }

    fn declare_deadlock(
        &self,
        send: &SendState,
        stalled: Duration,
        h2g_ok: bool,
        g2h_ok: bool,
    ) -> CtError {
        if self.h2g.mark_broken() {
            tracing::error!(
                stalled_ms = stalled.as_millis() as u64,
                h2g_starved = !h2g_ok,
                g2h_starved = !g2h_ok,
                "CT deadlocked:\n{}",
                self.snapshot(send)
            );
        }
        self.requests.wake_all();
        CtError::Broken
    }

    /// Next fence not used by any pending request.
    fn next_fence(&self, send: &mut SendState) -> u16 {
        loop {
            send.last_fence = send.last_fence.wrapping_add(1);
            if !self.requests.is_pending(send.last_fence) {
                return send.last_fence;
            }
        }
    }

    fn write_frame(
        &self,
        send: &mut SendState,
        fence: u16,
        hxg: HxgHeader,
        payload: &[u32],
        fast: bool,
    ) -> Result<(), CtError> {
        let header = CtbHeader::hxg(fence, payload.len()).ok_or(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_WORDS,
        })?;

        let mut frame = Vec::with_capacity(header.frame_len() as usize);
        frame.push(header.encode());
        frame.push(hxg.encode());
        frame.extend_from_slice(payload);

        self.h2g
            .write(&mut send.cursor, &frame)
            .map_err(|err| self.on_error(err))?;

        self.requests.record_send(SentRecord {
            fence,
            action: hxg.action(),
            fast,
        });
        tracing::debug!(
            fence,
            action = format_args!("{:#06x}", hxg.action()),
            len = frame.len(),
            fast,
            "H2G"
        );
        Ok(())
    }

    /// Wait out BUSY replies until a final status arrives.
    fn wait_for_reply(&self, slot: &RequestSlot) -> Result<u32, CtError> {
        loop {
            let status = slot.wait(
                self.config.response_spin,
                self.config.response_timeout,
                || self.check_live(),
            )?;
            let busy = matches!(
                HxgHeader::decode(status),
                Ok(header) if header.ty == HxgType::NoResponseBusy
            );
            if busy && slot.rearm(status) {
                tracing::debug!(fence = slot.fence(), "firmware busy, waiting again");
                continue;
            }
            return Ok(status);
        }
    }

    fn receive_all(&self) -> Result<(), CtError> {
        if !self.enabled.load(Ordering::Acquire) {
            tracing::warn!("G2H interrupt while disabled");
            return Err(CtError::NotEnabled);
        }

        loop {
            let frame = {
                let mut cursor = lock(&self.recv);
                self.g2h.read(&mut cursor)
            };
            match frame.map_err(|err| self.on_error(err))? {
                Some(words) => self.handle_message(IncomingMessage::new(words)),
                None => return Ok(()),
            }
        }
    }

    fn handle_message(&self, msg: IncomingMessage) {
        let fence = msg.fence();
        let hxg = msg.hxg_word();
        match self.classify(msg) {
            Ok(()) => {}
            Err(err @ CtError::ResponseTooLarge { .. }) => {
                tracing::warn!(fence, error = %err, "response truncated");
            }
            Err(err) => {
                tracing::warn!(
                    fence,
                    hxg = format_args!("{hxg:#010x}"),
                    error = %err,
                    "dropped G2H message"
                );
            }
        }
    }

    fn classify(&self, msg: IncomingMessage) -> Result<(), CtError> {
        let header = msg.header();
        if header.format != CTB_FORMAT_HXG {
            return Err(ProtocolError::UnknownFormat(header.format).into());
        }
        let hxg = msg.hxg()?;
        if hxg.origin != HxgOrigin::Firmware {
            return Err(ProtocolError::HostOrigin.into());
        }

        tracing::debug!(
            fence = header.fence,
            ty = ?hxg.ty,
            len = msg.len(),
            "G2H"
        );
        match hxg.ty {
            HxgType::Event => self.handle_event(msg, hxg.action()),
            ty if ty.is_response() => {
                let result = self
                    .requests
                    .complete(header.fence, msg.hxg_word(), msg.payload());
                // A failed fast request never gets its reply event.
                if ty == HxgType::ResponseFailure && result.is_ok() {
                    if let Some(held) = self.requests.forget_credit(header.fence) {
                        self.g2h.release_credit(held.words);
                    }
                }
                result
            }
            ty => Err(ProtocolError::UnexpectedType(ty).into()),
        }
    }

    fn handle_event(&self, msg: IncomingMessage, action: u16) -> Result<(), CtError> {
        let handler = self.handlers.get(action);
        if handler.as_ref().is_some_and(EventHandler::releases_credit) {
            match self.requests.settle_credit() {
                Some(held) => self.g2h.release_credit(held.words),
                None => tracing::warn!(
                    action = format_args!("{action:#06x}"),
                    "credit-releasing event with no outstanding reservation"
                ),
            }
        }

        match handler.map(|h| h.kind) {
            Some(HandlerKind::Immediate(handler)) => handler.handle_immediate(&msg),
            _ => {
                self.incoming.push(msg);
                self.worker.schedule();
                Ok(())
            }
        }
    }

    fn mmio(&self, request: &[u32]) -> Result<u32, CtError> {
        self.port
            .send_mmio(request)
            .map_err(|err| CtError::Mmio(err.to_string()))
    }

    fn self_cfg(&self, key: u16, value: u64) -> Result<(), CtError> {
        let accepted = self.mmio(&mmio::self_cfg(key, value))?;
        if accepted != 1 {
            return Err(CtError::Mmio(format!(
                "KLV {key:#06x} not accepted ({accepted})"
            )));
        }
        Ok(())
    }

    fn register(&self, ctb: &Ctb) -> Result<(), CtError> {
        let (desc_key, addr_key, size_key) = match ctb.direction() {
            Direction::H2g => (
                KLV_H2G_CTB_DESCRIPTOR_ADDR,
                KLV_H2G_CTB_ADDR,
                KLV_H2G_CTB_SIZE,
            ),
            Direction::G2h => (
                KLV_G2H_CTB_DESCRIPTOR_ADDR,
                KLV_G2H_CTB_ADDR,
                KLV_G2H_CTB_SIZE,
            ),
        };
        let ring = ctb.ring();
        self.self_cfg(desc_key, ring.desc_addr())
            .and_then(|()| self.self_cfg(addr_key, ring.cmds_addr()))
            .and_then(|()| self.self_cfg(size_key, u64::from(ring.size_bytes())))
            .map_err(|err| {
                tracing::error!(
                    direction = ctb.direction().as_str(),
                    error = %err,
                    "failed to register buffer"
                );
                err
            })
    }

    fn snapshot(&self, send: &SendState) -> ChannelInfo {
        let h2g = CtbInfo::capture(&self.h2g, send.cursor);
        let g2h = CtbInfo::capture(&self.g2h, *lock(&self.recv));
        ChannelInfo {
            enabled: self.enabled.load(Ordering::Acquire),
            h2g,
            g2h,
            last_fence: send.last_fence,
            pending: self.requests.pending_fences(),
            held_credit: self.requests.held_credit(),
            recent_sends: self.requests.recent_sends(),
            queued_events: self.incoming.len(),
            stalled_for: send.stall.elapsed(Instant::now()),
        }
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        self.worker.shutdown();
        if self.enabled.load(Ordering::Acquire) && self.port.is_running() {
            if let Err(err) = self.mmio(&mmio::control_ctb(false)) {
                tracing::warn!(error = %err, "failed to disable CT on drop");
            }
        }
    }
}

/// Snapshot of one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtbInfo {
    pub size: u32,
    /// Shared descriptor head and tail.
    pub head: u32,
    pub tail: u32,
    /// Host-local copies.
    pub local_head: u32,
    pub local_tail: u32,
    pub status: DescStatus,
    /// H2G: cached free words. G2H: unreserved reply credit.
    pub space: u32,
    pub broken: bool,
}

impl CtbInfo {
    fn capture(ctb: &Ctb, cursor: Cursor) -> Self {
        let ring = ctb.ring();
        Self {
            size: ring.size(),
            head: ring.head(),
            tail: ring.tail(),
            local_head: cursor.head,
            local_tail: cursor.tail,
            status: ring.status(),
            space: ctb.space(),
            broken: ctb.is_broken(),
        }
    }
}

impl fmt::Display for CtbInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} head={} ({}) tail={} ({}) status={:#x} space={}{}",
            self.size,
            self.head,
            self.local_head,
            self.tail,
            self.local_tail,
            self.status.bits(),
            self.space,
            if self.broken { " BROKEN" } else { "" }
        )
    }
}

/// Diagnostic snapshot of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub enabled: bool,
    pub h2g: CtbInfo,
    pub g2h: CtbInfo,
    pub last_fence: u16,
    /// Fences of blocking requests still waiting for a response.
    pub pending: Vec<u16>,
    /// G2H credit held by non-blocking sends awaiting their reply event.
    pub held_credit: u32,
    pub recent_sends: Vec<SentRecord>,
    pub queued_events: usize,
    pub stalled_for: Option<Duration>,
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "enabled: {}", self.enabled)?;
        writeln!(f, "H2G: {}", self.h2g)?;
        writeln!(f, "G2H: {}", self.g2h)?;
        writeln!(f, "last fence: {}", self.last_fence)?;
        writeln!(f, "pending: {:?}", self.pending)?;
        writeln!(f, "held credit: {}", self.held_credit)?;
        writeln!(f, "queued events: {}", self.queued_events)?;
        if let Some(stalled) = self.stalled_for {
            writeln!(f, "stalled for: {stalled:?}")?;
        }
        write!(f, "recent sends:")?;
        for sent in &self.recent_sends {
            write!(
                f,
                "\n  fence {} action {:#06x}{}",
                sent.fence,
                sent.action,
                if sent.fast { " (fast)" } else { "" }
            )?;
        }
        Ok(())
    }
}
