use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Buffer, SlotState, SECTOR_SIZE};
use crate::error::CoreError;
use crate::invariants::{
    debug_assert_pool_at_rest, debug_assert_rent_refcount_one, debug_assert_return_from_positive,
};

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Size of every block in the pool, in bytes. Must be a positive
    /// multiple of [`SECTOR_SIZE`].
    pub block_size: usize,
    /// Total number of preallocated buffers.
    pub capacity: usize,
}

impl BufferPoolConfig {
    /// Creates a new configuration, validating the block size and capacity.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfiguration`] if `block_size` is zero or
    /// not a multiple of [`SECTOR_SIZE`], or if `capacity` is zero.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self, CoreError> {
        if block_size == 0 || block_size % SECTOR_SIZE != 0 {
            return Err(CoreError::InvalidConfiguration(format!(
                "block_size {block_size} must be a positive multiple of the sector size {SECTOR_SIZE}"
            )));
        }
        if capacity == 0 {
            return Err(CoreError::InvalidConfiguration(
                "capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            capacity,
        })
    }
}

/// The shared state behind a [`BufferPool`]. Buffer handles hold an `Arc` of
/// this so they can release themselves back into the pool on drop.
pub(crate) struct PoolInner {
    pub(crate) slots: Vec<SlotState>,
    pub(crate) block_size: usize,
    capacity: usize,
    free: Mutex<VecDeque<usize>>,
    semaphore: Semaphore,
    disposed: AtomicBool,
}

impl PoolInner {
    /// Called from [`Buffer::drop`]. Lowers the slot's refcount; once it
    /// reaches zero the slot is requeued and one capacity permit is
    /// released, waking exactly one waiter.
    pub(crate) fn release(&self, index: usize) {
        let slot = &self.slots[index];
        let prev = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert_return_from_positive!(prev);
        if prev == 1 {
            self.free.lock().unwrap().push_back(index);
            self.semaphore.add_permits(1);
        }
    }
}

/// A fixed preallocated set of sector-aligned buffers, handed out one at a
/// time with capacity-bounded backpressure.
///
/// Cloning a `BufferPool` is cheap and shares the same underlying arena —
/// every clone rents from and returns to the same slot table.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Preallocates `config.capacity` buffers of `config.block_size` bytes
    /// each.
    #[must_use]
    pub fn new(config: BufferPoolConfig) -> Self {
        let slots = (0..config.capacity)
            .map(|_| SlotState::new(config.block_size))
            .collect();
        let free = (0..config.capacity).collect();

        Self {
            inner: Arc::new(PoolInner {
                slots,
                block_size: config.block_size,
                capacity: config.capacity,
                free: Mutex::new(free),
                semaphore: Semaphore::new(config.capacity),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The fixed block size of every buffer in this pool.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// The total number of buffers preallocated in this pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Rents a buffer, waiting until one is available or `cancel` fires.
    ///
    /// Pass `cancel: None` for rents that must never observe cancellation
    /// (e.g. the verification scratch buffer, to guarantee `finalize` always
    /// runs to completion).
    ///
    /// # Errors
    /// Returns [`CoreError::Disposed`] if the pool has been disposed, or
    /// [`CoreError::Canceled`] if `cancel` fires before a buffer becomes
    /// available.
    pub async fn rent(&self, cancel: Option<&CancellationToken>) -> Result<Buffer, CoreError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CoreError::Disposed);
        }

        let acquire = self.inner.semaphore.acquire();
        let permit = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CoreError::Canceled),
                res = acquire => res.map_err(|_| CoreError::Disposed)?,
            },
            None => acquire.await.map_err(|_| CoreError::Disposed)?,
        };
        // The pool manages permits manually via `PoolInner::release`, not via
        // the guard's own drop, so the acquired permit is forgotten here.
        permit.forget();

        if self.inner.disposed.load(Ordering::Acquire) {
            self.inner.semaphore.add_permits(1);
            return Err(CoreError::Disposed);
        }

        let index = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore permit implies a free slot exists");

        let slot = &self.inner.slots[index];
        slot.refcount.store(1, Ordering::Release);
        slot.valid_len.store(0, Ordering::Release);
        debug_assert_rent_refcount_one!(slot.refcount.load(Ordering::Acquire));

        Ok(Buffer {
            pool: Arc::clone(&self.inner),
            index,
        })
    }

    /// Explicitly returns a buffer. Equivalent to dropping it, but checks
    /// that the handle actually belongs to this pool first.
    ///
    /// # Errors
    /// Returns [`CoreError::Invariant`] if `buffer` was rented from a
    /// different pool.
    pub fn return_buffer(&self, buffer: Buffer) -> Result<(), CoreError> {
        if !Arc::ptr_eq(&buffer.pool, &self.inner) {
            // Don't run `buffer`'s Drop against our own slot table.
            std::mem::forget(buffer);
            return Err(CoreError::Invariant(
                "buffer does not belong to this pool".to_string(),
            ));
        }
        drop(buffer);
        Ok(())
    }

    /// Asserts that every buffer is present and idle: the pool is fully "at
    /// rest". Checkable before and after every transfer.
    ///
    /// # Errors
    /// Returns [`CoreError::Invariant`] if any buffer is still rented or the
    /// free queue is short of `capacity`.
    pub fn invariant(&self) -> Result<(), CoreError> {
        let available = self.inner.free.lock().unwrap().len();
        debug_assert_pool_at_rest!(available, self.inner.capacity);
        if available != self.inner.capacity {
            return Err(CoreError::Invariant(format!(
                "pool not at rest: {available} of {} buffers available",
                self.inner.capacity
            )));
        }
        for (index, slot) in self.inner.slots.iter().enumerate() {
            let refcount = slot.refcount.load(Ordering::Acquire);
            if refcount != 0 {
                return Err(CoreError::Invariant(format!(
                    "buffer {index} has refcount {refcount}, expected 0 at rest"
                )));
            }
        }
        Ok(())
    }

    /// Marks the pool as disposed. Subsequent `rent` calls fail with
    /// [`CoreError::Disposed`]; buffers already rented may still be
    /// returned.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }
}
