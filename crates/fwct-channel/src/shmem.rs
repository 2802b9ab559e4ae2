//! Host/firmware shared memory.
//!
//! The blob is modelled as an array of 32-bit atomics so both sides can access it without
//! `unsafe`. Addresses handed to the firmware are `base_addr + byte offset`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fwct_abi::layout::WORD_BYTES;

/// One contiguous, firmware-visible allocation.
pub struct SharedBlob {
    base_addr: u64,
    words: Box<[AtomicU32]>,
}

impl SharedBlob {
    /// Zero-filled blob of at least `size_bytes` bytes mapped at `base_addr`.
    pub fn new(base_addr: u64, size_bytes: usize) -> Self {
        let words = size_bytes.div_ceil(WORD_BYTES);
        Self {
            base_addr,
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Firmware-visible address of `offset_bytes`.
    pub fn addr_of(&self, offset_bytes: usize) -> u64 {
        self.base_addr + offset_bytes as u64
    }

    /// Inverse of [`SharedBlob::addr_of`]; `None` if `addr` is outside the blob.
    pub fn offset_of(&self, addr: u64) -> Option<usize> {
        let offset = usize::try_from(addr.checked_sub(self.base_addr)?).ok()?;
        (offset < self.len_bytes()).then_some(offset)
    }

    pub fn load(&self, word: usize, order: Ordering) -> u32 {
        self.words[word].load(order)
    }

    pub fn store(&self, word: usize, value: u32, order: Ordering) {
        self.words[word].store(value, order);
    }

    pub fn fetch_or(&self, word: usize, bits: u32, order: Ordering) -> u32 {
        self.words[word].fetch_or(bits, order)
    }

    pub fn fetch_and(&self, word: usize, bits: u32, order: Ordering) -> u32 {
        self.words[word].fetch_and(bits, order)
    }

    pub fn fill(&self, word: usize, len: usize, value: u32) {
        for w in &self.words[word..word + len] {
            w.store(value, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for SharedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBlob")
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("requested {requested} bytes, only {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// Source of firmware-visible memory.
pub trait SharedMemoryAllocator: Send + Sync {
    fn allocate(&self, size_bytes: usize) -> Result<Arc<SharedBlob>, AllocError>;
}

/// Heap-backed allocator handing out addresses from a fake aperture.
#[derive(Debug)]
pub struct HeapAllocator {
    next_addr: AtomicU64,
    end_addr: u64,
}

impl HeapAllocator {
    pub const DEFAULT_BASE: u64 = 0x0010_0000;
    pub const DEFAULT_APERTURE: u64 = 256 << 20;
    const ALIGN: u64 = 4096;

    pub fn new(base_addr: u64, aperture_bytes: u64) -> Self {
        Self {
            next_addr: AtomicU64::new(base_addr),
            end_addr: base_addr.saturating_add(aperture_bytes),
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_APERTURE)
    }
}

impl SharedMemoryAllocator for HeapAllocator {
    fn allocate(&self, size_bytes: usize) -> Result<Arc<SharedBlob>, AllocError> {
        let size = (size_bytes as u64).div_ceil(Self::ALIGN) * Self::ALIGN;
        let mut current = self.next_addr.load(Ordering::Relaxed);
        loop {
            let available = self.end_addr.saturating_sub(current);
            if size > available {
                return Err(AllocError::Exhausted {
                    requested: size_bytes,
                    available: available as usize,
                });
            }
            match self.next_addr.compare_exchange_weak(
                current,
                current + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(Arc::new(SharedBlob::new(current, size_bytes))),
                Err(actual) => current = actual,
            }
        }
    }
}
