//! Inbound G2H dispatch.
//!
//! The interrupt path classifies every frame. Events whose handler was registered as immediate
//! run inline; everything else is copied into the incoming queue and picked up by the deferred
//! worker, which is allowed to block and to send.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use fwct_abi::ctb::CTB_MSG_MIN_LEN;
use fwct_abi::{CtbHeader, HxgHeader, CTB_HDR_LEN};

use crate::channel::{Channel, WeakChannel};
use crate::error::{CtError, ProtocolError};
use crate::lock;

/// One received frame: CTB header, HXG header, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    words: Vec<u32>,
}

impl IncomingMessage {
    pub fn new(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Whole frame.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Frame length in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn header(&self) -> CtbHeader {
        CtbHeader::decode(self.words.first().copied().unwrap_or(0))
    }

    pub fn fence(&self) -> u16 {
        self.header().fence
    }

    /// Raw HXG header word (0 for a truncated frame).
    pub fn hxg_word(&self) -> u32 {
        self.words.get(CTB_HDR_LEN as usize).copied().unwrap_or(0)
    }

    pub fn hxg(&self) -> Result<HxgHeader, ProtocolError> {
        if self.words.len() < CTB_MSG_MIN_LEN as usize {
            return Err(ProtocolError::ShortFrame(self.words.len()));
        }
        Ok(HxgHeader::decode(self.hxg_word())?)
    }

    /// Action code of an event.
    pub fn action(&self) -> u16 {
        self.hxg_word() as u16
    }

    /// Words after the HXG header.
    pub fn payload(&self) -> &[u32] {
        self.words.get(CTB_MSG_MIN_LEN as usize..).unwrap_or(&[])
    }
}

/// Handler that runs on the interrupt path.
///
/// It gets no channel handle, so it cannot send; it must not block.
pub trait ImmediateHandler: Send + Sync {
    fn handle_immediate(&self, msg: &IncomingMessage) -> Result<(), CtError>;
}

impl<F> ImmediateHandler for F
where
    F: Fn(&IncomingMessage) -> Result<(), CtError> + Send + Sync,
{
    fn handle_immediate(&self, msg: &IncomingMessage) -> Result<(), CtError> {
        self(msg)
    }
}

/// Handler that runs on the deferred worker and may send on `channel`.
pub trait DeferredHandler: Send + Sync {
    fn handle(&self, channel: &Channel, msg: &IncomingMessage) -> Result<(), CtError>;
}

impl<F> DeferredHandler for F
where
    F: Fn(&Channel, &IncomingMessage) -> Result<(), CtError> + Send + Sync,
{
    fn handle(&self, channel: &Channel, msg: &IncomingMessage) -> Result<(), CtError> {
        self(channel, msg)
    }
}

#[derive(Clone)]
pub(crate) enum HandlerKind {
    Immediate(Arc<dyn ImmediateHandler>),
    Deferred(Arc<dyn DeferredHandler>),
}

/// A registered event handler.
#[derive(Clone)]
pub struct EventHandler {
    pub(crate) kind: HandlerKind,
    pub(crate) releases_credit: bool,
}

impl EventHandler {
    pub fn immediate(handler: impl ImmediateHandler + 'static) -> Self {
        Self {
            kind: HandlerKind::Immediate(Arc::new(handler)),
            releases_credit: false,
        }
    }

    pub fn deferred(handler: impl DeferredHandler + 'static) -> Self {
        Self {
            kind: HandlerKind::Deferred(Arc::new(handler)),
            releases_credit: false,
        }
    }

    /// Events of this action answer a non-blocking send: receiving one returns the G2H credit
    /// held by the oldest outstanding non-blocking send.
    pub fn releasing_credit(mut self) -> Self {
        self.releases_credit = true;
        self
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, HandlerKind::Immediate(_))
    }

    pub fn releases_credit(&self) -> bool {
        self.releases_credit
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("immediate", &self.is_immediate())
            .field("releases_credit", &self.releases_credit)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<u16, EventHandler>>,
}

impl HandlerTable {
    pub fn register(&self, action: u16, handler: EventHandler) -> Option<EventHandler> {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(action, handler)
    }

    pub fn get(&self, action: u16) -> Option<EventHandler> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&action).cloned()
    }
}

/// FIFO of events waiting for the deferred worker.
#[derive(Debug, Default)]
pub(crate) struct IncomingQueue {
    inner: Mutex<VecDeque<IncomingMessage>>,
}

impl IncomingQueue {
    pub fn push(&self, msg: IncomingMessage) {
        lock(&self.inner).push_back(msg);
    }

    /// Pop the oldest message and report whether the queue is now empty.
    pub fn pop(&self) -> (Option<IncomingMessage>, bool) {
        let mut queue = lock(&self.inner);
        let msg = queue.pop_front();
        (msg, queue.is_empty())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    scheduled: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct WorkerSignal {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// Runs deferred handlers off the interrupt path.
///
/// Scheduling is idempotent: any number of `schedule` calls before the worker wakes result in a
/// single drain of the queue.
#[derive(Debug, Default)]
pub(crate) struct DeferredWorker {
    signal: Arc<WorkerSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl DeferredWorker {
    /// Start the worker thread for `channel`.
    pub fn spawn(&self, channel: WeakChannel) -> Result<(), CtError> {
        let signal = Arc::clone(&self.signal);
        let handle = thread::Builder::new()
            .name("fwct-deferred".into())
            .spawn(move || worker_loop(&signal, &channel))
            .map_err(|err| CtError::OutOfMemory(format!("deferred worker: {err}")))?;
        *lock(&self.thread_id) = Some(handle.thread().id());
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Request a drain. Returns `true` if a drain was not already pending.
    pub fn schedule(&self) -> bool {
        let mut state = lock(&self.signal.state);
        let newly = !state.scheduled;
        state.scheduled = true;
        self.signal.cond.notify_one();
        newly
    }

    /// Whether a drain has been requested and not yet started.
    pub fn is_scheduled(&self) -> bool {
        lock(&self.signal.state).scheduled
    }

    /// Consume a pending request for manual dispatch.
    pub fn take_scheduled(&self) -> bool {
        std::mem::take(&mut lock(&self.signal.state).scheduled)
    }

    /// Stop the worker thread and join it unless called from the worker itself.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.signal.state);
            state.shutdown = true;
            self.signal.cond.notify_all();
        }

        let on_worker = *lock(&self.thread_id) == Some(thread::current().id());
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if on_worker {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("deferred worker panicked");
            }
        }
    }
}

fn worker_loop(signal: &WorkerSignal, channel: &WeakChannel) {
    loop {
        {
            let mut state = lock(&signal.state);
            while !state.scheduled && !state.shutdown {
                state = match signal.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if state.shutdown {
                return;
            }
            state.scheduled = false;
        }

        let Some(channel) = channel.upgrade() else {
            return;
        };
        channel.run_deferred_work();
    }
}
