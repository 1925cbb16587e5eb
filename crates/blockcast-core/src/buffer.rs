use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::invariants::{debug_assert_len_in_bounds, debug_assert_sector_aligned};
use crate::pool::PoolInner;

/// Alignment granularity required for unbuffered file I/O.
pub const SECTOR_SIZE: usize = 4096;

/// A single sector-aligned, fixed-capacity region owned by a [`crate::BufferPool`].
///
/// Allocated once at pool construction and never resized; [`Drop`] frees the
/// region when the pool itself is torn down.
pub(crate) struct RawAligned {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawAligned {
    pub(crate) fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, SECTOR_SIZE)
            .expect("capacity/alignment already validated by BufferPoolConfig");
        // Safety: layout has non-zero size (capacity is validated > 0).
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

        debug_assert_sector_aligned!(ptr.as_ptr() as usize, SECTOR_SIZE);

        Self { ptr, layout }
    }

    /// # Safety
    /// The caller must ensure no other live borrow of this region is being
    /// written to concurrently. Enforced by the buffer-pool protocol: a
    /// region is only mutated while its refcount is 1 (sole producer
    /// ownership, before broadcast).
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
    }

    /// # Safety
    /// See [`RawAligned::as_slice`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
    }
}

impl Drop for RawAligned {
    fn drop(&mut self) {
        // Safety: `layout` is the exact layout used to allocate `ptr`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the region is only ever accessed through the pool's rent/return
// protocol, which serializes mutation to the sole-owner window.
unsafe impl Send for RawAligned {}
unsafe impl Sync for RawAligned {}

/// Per-slot metadata: sequence number, valid-data length, and refcount.
///
/// Lives inside the pool's slot table; a [`Buffer`] handle is a thin
/// `(pool, index)` pair that dereferences into this state.
pub(crate) struct SlotState {
    pub(crate) storage: RawAligned,
    pub(crate) sequence: AtomicU64,
    pub(crate) valid_len: AtomicUsize,
    pub(crate) refcount: AtomicUsize,
}

impl SlotState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            storage: RawAligned::new(capacity),
            sequence: AtomicU64::new(0),
            valid_len: AtomicUsize::new(0),
            refcount: AtomicUsize::new(0),
        }
    }
}

/// A handle to one rented, sector-aligned block.
///
/// `Buffer` is a reference-counted handle: [`Clone`] raises the slot's
/// refcount (used by the producer to fan a block out to every consumer plus
/// the optional reference hasher), and [`Drop`] lowers it, returning the
/// underlying slot to the pool's free queue once the count reaches zero.
pub struct Buffer {
    pub(crate) pool: Arc<PoolInner>,
    pub(crate) index: usize,
}

impl Buffer {
    /// The fixed capacity of this block (equal to the pool's block size).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.block_size
    }

    /// The zero-based sequence number assigned by the producer state machine.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.slot().sequence.load(Ordering::Acquire)
    }

    /// Stamps the sequence number claimed for this block. Called once by the
    /// producer state machine right after a fetch-and-increment claim, before
    /// `fill` runs; not meant for worker code.
    pub fn set_sequence(&self, sequence: u64) {
        self.slot().sequence.store(sequence, Ordering::Release);
    }

    /// The number of valid bytes at the front of [`Buffer::memory`].
    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.slot().valid_len.load(Ordering::Acquire)
    }

    /// Records how many bytes `fill` actually wrote. Called once by the
    /// producer state machine after `fill` returns; not meant for worker
    /// code.
    pub fn set_valid_len(&self, len: usize) {
        debug_assert_len_in_bounds!(len, self.capacity());
        self.slot().valid_len.store(len, Ordering::Release);
    }

    /// The full block-sized region. Consumers must treat this as read-only;
    /// only the producer's fill task may write to it, and only before the
    /// block is broadcast (refcount == 1).
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        // Safety: see `RawAligned::as_slice` — mutation only happens while
        // this handle is the sole owner, which holds for the fill path.
        unsafe { self.slot().storage.as_slice() }
    }

    /// The valid prefix of [`Buffer::memory`], i.e. `&memory()[..valid_len()]`.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.memory()[..self.valid_len()]
    }

    /// Mutable access to the full block. Only safe to call while this
    /// `Buffer` is the sole handle to its slot (refcount == 1) — i.e. from
    /// the producer's fill task, before the block has been cloned out to
    /// consumers.
    #[must_use]
    pub fn memory_mut(&mut self) -> &mut [u8] {
        // Safety: caller contract above; refcount == 1 during fill.
        unsafe { self.slot().storage.as_mut_slice() }
    }

    fn slot(&self) -> &SlotState {
        &self.pool.slots[self.index]
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.slot().refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("sequence", &self.sequence())
            .field("valid_len", &self.valid_len())
            .finish()
    }
}
