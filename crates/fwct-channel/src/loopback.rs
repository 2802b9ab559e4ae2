//! In-process firmware model.
//!
//! [`LoopbackFirmware`] plays the device side of the transport: it hands out the shared blob,
//! learns ring addresses from the SELF_CFG handshake, consumes H2G frames when the doorbell rings
//! and answers them through a pluggable responder. It is what the tests drive, and it is a usable
//! reference for wiring a real device behind [`FirmwarePort`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fwct_abi::hxg::HxgHeader;
use fwct_abi::layout::DESC_BYTES;
use fwct_abi::mmio::{
    klv_len, MmioRequest, KLV_G2H_CTB_ADDR, KLV_G2H_CTB_DESCRIPTOR_ADDR, KLV_G2H_CTB_SIZE,
    KLV_H2G_CTB_ADDR, KLV_H2G_CTB_DESCRIPTOR_ADDR, KLV_H2G_CTB_SIZE,
};
use fwct_abi::{CtbHeader, HxgType, Region, CTB_FORMAT_HXG};

use crate::channel::Channel;
use crate::lock;
use crate::port::{FirmwarePort, MmioError};
use crate::ring::{circ_cnt, circ_space, RingView};
use crate::shmem::{AllocError, HeapAllocator, SharedBlob, SharedMemoryAllocator};

/// A host request as seen by the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub fence: u16,
    pub ty: HxgType,
    pub action: u16,
    pub payload: Vec<u32>,
}

impl Request {
    fn parse(frame: &[u32]) -> Option<Self> {
        let header = CtbHeader::decode(*frame.first()?);
        if header.format != CTB_FORMAT_HXG {
            return None;
        }
        let hxg = HxgHeader::decode(*frame.get(1)?).ok()?;
        Some(Self {
            fence: header.fence,
            ty: hxg.ty,
            action: hxg.action(),
            payload: frame[2..].to_vec(),
        })
    }
}

/// What the firmware answers to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(Vec<u32>),
    Failure { error: u16, hint: u16 },
    Retry { reason: u32 },
    /// A NO_RESPONSE_BUSY frame followed by `then`.
    Busy { reason: u32, then: Box<Reply> },
    /// An unsolicited event, typically the answer to a fast request.
    Event { action: u16, payload: Vec<u32> },
    Silent,
}

impl Reply {
    fn frames(self, fence: u16, out: &mut Vec<Vec<u32>>) {
        let frame = |fence: u16, hxg: HxgHeader, payload: &[u32]| -> Option<Vec<u32>> {
            let header = CtbHeader::hxg(fence, payload.len())?;
            let mut words = vec![header.encode(), hxg.encode()];
            words.extend_from_slice(payload);
            Some(words)
        };
        let produced = match self {
            Reply::Success(payload) => frame(fence, HxgHeader::success(0), &payload),
            Reply::Failure { error, hint } => frame(fence, HxgHeader::failure(error, hint), &[]),
            Reply::Retry { reason } => frame(fence, HxgHeader::retry(reason), &[]),
            Reply::Busy { reason, then } => {
                out.extend(frame(fence, HxgHeader::busy(reason), &[]));
                (*then).frames(fence, out);
                None
            }
            Reply::Event { action, payload } => frame(0, HxgHeader::event(action), &payload),
            Reply::Silent => None,
        };
        out.extend(produced);
    }
}

/// Firmware-side accessor for one ring.
#[derive(Debug, Clone)]
pub struct PeerRing {
    view: RingView,
}

impl PeerRing {
    pub fn new(view: RingView) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &RingView {
        &self.view
    }

    /// Words published by the producer and not yet consumed.
    pub fn pending_words(&self) -> u32 {
        circ_cnt(self.view.head(), self.view.tail(), self.view.size())
    }

    /// Consume the next complete frame.
    pub fn pop(&self) -> Option<Vec<u32>> {
        let size = self.view.size();
        let head = self.view.head();
        let tail = self.view.tail();
        if head >= size || tail >= size {
            return None;
        }
        let available = circ_cnt(head, tail, size);
        if available == 0 {
            return None;
        }
        let len = CtbHeader::decode(self.view.word(head)).frame_len();
        if len > available {
            return None;
        }

        let mut frame = Vec::with_capacity(len as usize);
        let mut at = head;
        for _ in 0..len {
            frame.push(self.view.word(at));
            at = (at + 1) % size;
        }
        self.view.publish_head(at);
        Some(frame)
    }

    /// Append a frame, or return `false` if it does not fit.
    pub fn push(&self, frame: &[u32]) -> bool {
        let size = self.view.size();
        let head = self.view.head();
        let tail = self.view.tail();
        if head >= size || tail >= size || circ_space(head, tail, size) < frame.len() as u32 {
            return false;
        }

        let mut at = tail;
        for &word in frame {
            self.view.set_word(at, word);
            at = (at + 1) % size;
        }
        self.view.publish_tail(at);
        true
    }
}

type Responder = Box<dyn Fn(&Request) -> Reply + Send + Sync>;
type IrqLine = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FirmwareState {
    blob: Option<Arc<SharedBlob>>,
    klvs: HashMap<u16, u64>,
    mmio_log: Vec<MmioRequest>,
    /// `(h2g, g2h)` while CONTROL_CTB(enable) is in effect.
    rings: Option<(PeerRing, PeerRing)>,
    received: Vec<Request>,
}

impl FirmwareState {
    fn resolve(&self, desc_key: u16, addr_key: u16, size_key: u16) -> Option<PeerRing> {
        let blob = self.blob.as_ref()?;
        let desc = blob.offset_of(*self.klvs.get(&desc_key)?)?;
        let cmds = blob.offset_of(*self.klvs.get(&addr_key)?)?;
        let size = usize::try_from(*self.klvs.get(&size_key)?).ok()?;
        if !size.is_power_of_two() || desc + DESC_BYTES > blob.len_bytes() {
            return None;
        }
        if cmds.checked_add(size)? > blob.len_bytes() {
            return None;
        }

        Some(PeerRing {
            view: RingView::new(
                Arc::clone(blob),
                Region {
                    offset_bytes: desc,
                    len_bytes: DESC_BYTES,
                },
                Region {
                    offset_bytes: cmds,
                    len_bytes: size,
                },
            ),
        })
    }
}

/// Echo every request's payload back; ignore fast requests.
pub fn echo_responder(request: &Request) -> Reply {
    match request.ty {
        HxgType::Request => Reply::Success(request.payload.clone()),
        _ => Reply::Silent,
    }
}

pub struct LoopbackFirmware {
    allocator: HeapAllocator,
    state: Mutex<FirmwareState>,
    responder: RwLock<Responder>,
    irq: RwLock<Option<IrqLine>>,
    stalled: AtomicBool,
    running: AtomicBool,
    doorbells: AtomicU64,
}

impl LoopbackFirmware {
    pub fn new() -> Arc<Self> {
        Self::with_responder(echo_responder)
    }

    pub fn with_responder(responder: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            allocator: HeapAllocator::default(),
            state: Mutex::new(FirmwareState::default()),
            responder: RwLock::new(Box::new(responder)),
            irq: RwLock::new(None),
            stalled: AtomicBool::new(false),
            running: AtomicBool::new(true),
            doorbells: AtomicU64::new(0),
        })
    }

    pub fn set_responder(&self, responder: impl Fn(&Request) -> Reply + Send + Sync + 'static) {
        let mut slot = match self.responder.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Box::new(responder);
    }

    /// Install the interrupt line. Called after G2H frames are published.
    pub fn set_irq(&self, irq: impl Fn() + Send + Sync + 'static) {
        let mut slot = match self.irq.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(irq));
    }

    /// Route the interrupt line to `channel`'s receive path.
    pub fn connect(&self, channel: &Channel) {
        let weak = channel.downgrade();
        self.set_irq(move || {
            if let Some(channel) = weak.upgrade() {
                if let Err(err) = channel.handle_interrupt() {
                    tracing::debug!(error = %err, "interrupt not handled");
                }
            }
        });
    }

    /// While stalled, doorbells are counted but H2G is left untouched.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn doorbell_count(&self) -> u64 {
        self.doorbells.load(Ordering::Acquire)
    }

    /// Whether CONTROL_CTB(enable) is in effect.
    pub fn is_enabled(&self) -> bool {
        lock(&self.state).rings.is_some()
    }

    pub fn received(&self) -> Vec<Request> {
        lock(&self.state).received.clone()
    }

    pub fn mmio_log(&self) -> Vec<MmioRequest> {
        lock(&self.state).mmio_log.clone()
    }

    pub fn klv(&self, key: u16) -> Option<u64> {
        lock(&self.state).klvs.get(&key).copied()
    }

    pub fn h2g(&self) -> Option<PeerRing> {
        lock(&self.state).rings.as_ref().map(|(h2g, _)| h2g.clone())
    }

    pub fn g2h(&self) -> Option<PeerRing> {
        lock(&self.state).rings.as_ref().map(|(_, g2h)| g2h.clone())
    }

    /// Consume and answer everything queued on H2G, then raise the interrupt if anything was
    /// written to G2H. Returns the number of requests consumed.
    pub fn service(&self) -> usize {
        let (consumed, replied) = self.drain_h2g();
        if replied {
            self.raise_irq();
        }
        consumed
    }

    /// Publish an event on G2H and raise the interrupt.
    pub fn inject_event(&self, action: u16, payload: &[u32]) -> bool {
        let mut frames = Vec::new();
        Reply::Event {
            action,
            payload: payload.to_vec(),
        }
        .frames(0, &mut frames);
        self.inject_frames(&frames)
    }

    /// Publish raw frames on G2H and raise the interrupt.
    pub fn inject_frames(&self, frames: &[Vec<u32>]) -> bool {
        let Some(g2h) = self.g2h() else {
            return false;
        };
        let pushed = frames.iter().all(|frame| g2h.push(frame));
        self.raise_irq();
        pushed
    }

    pub fn raise_irq(&self) {
        let irq = match self.irq.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(irq) = irq.as_ref() {
            irq();
        }
    }

    fn drain_h2g(&self) -> (usize, bool) {
        let mut state = lock(&self.state);
        let Some((h2g, g2h)) = state.rings.clone() else {
            return (0, false);
        };
        let responder = match self.responder.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut consumed = 0;
        let mut replied = false;
        while let Some(frame) = h2g.pop() {
            let Some(request) = Request::parse(&frame) else {
                tracing::warn!(header = format_args!("{:#010x}", frame[0]), "firmware dropped frame");
                continue;
            };
            consumed += 1;

            let mut frames = Vec::new();
            responder(&request).frames(request.fence, &mut frames);
            for frame in &frames {
                if !g2h.push(frame) {
                    tracing::warn!(fence = request.fence, "G2H full, reply dropped");
                    continue;
                }
                replied = true;
            }
            state.received.push(request);
        }
        (consumed, replied)
    }
}

impl SharedMemoryAllocator for LoopbackFirmware {
    fn allocate(&self, size_bytes: usize) -> Result<Arc<SharedBlob>, AllocError> {
        let blob = self.allocator.allocate(size_bytes)?;
        lock(&self.state).blob = Some(Arc::clone(&blob));
        Ok(blob)
    }
}

impl FirmwarePort for LoopbackFirmware {
    fn ring_doorbell(&self) {
        self.doorbells.fetch_add(1, Ordering::AcqRel);
        if !self.stalled.load(Ordering::Acquire) {
            self.service();
        }
    }

    fn send_mmio(&self, request: &[u32]) -> Result<u32, MmioError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(MmioError::NotRunning);
        }
        let decoded = MmioRequest::decode(request).ok_or(MmioError::Malformed)?;

        let mut state = lock(&self.state);
        state.mmio_log.push(decoded);
        match decoded {
            MmioRequest::SelfCfg(cfg) => {
                let known = matches!(
                    cfg.key,
                    KLV_H2G_CTB_ADDR
                        | KLV_H2G_CTB_DESCRIPTOR_ADDR
                        | KLV_H2G_CTB_SIZE
                        | KLV_G2H_CTB_ADDR
                        | KLV_G2H_CTB_DESCRIPTOR_ADDR
                        | KLV_G2H_CTB_SIZE
                );
                if !known || cfg.len != klv_len(cfg.key) {
                    return Ok(0);
                }
                state.klvs.insert(cfg.key, cfg.value);
                Ok(1)
            }
            MmioRequest::ControlCtb { enable: true } => {
                let h2g = state.resolve(
                    KLV_H2G_CTB_DESCRIPTOR_ADDR,
                    KLV_H2G_CTB_ADDR,
                    KLV_H2G_CTB_SIZE,
                );
                let g2h = state.resolve(
                    KLV_G2H_CTB_DESCRIPTOR_ADDR,
                    KLV_G2H_CTB_ADDR,
                    KLV_G2H_CTB_SIZE,
                );
                match h2g.zip(g2h) {
                    Some(rings) => {
                        state.rings = Some(rings);
                        Ok(0)
                    }
                    None => Err(MmioError::Rejected { error: 0x1 }),
                }
            }
            MmioRequest::ControlCtb { enable: false } => {
                state.rings = None;
                Ok(0)
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
