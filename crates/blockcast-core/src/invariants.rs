//! Debug assertion macros for buffer-pool and aligned-buffer invariants.
//!
//! Active only under `cfg(debug_assertions)`, so there is zero overhead in
//! release builds.

// =============================================================================
// INV-BUF-01: Sector Alignment
// =============================================================================

/// Assert that a raw pointer's address is a multiple of the sector size.
///
/// **Invariant**: `addr(buffer.memory) % SECTOR_SIZE == 0`
macro_rules! debug_assert_sector_aligned {
    ($addr:expr, $sector_size:expr) => {
        debug_assert!(
            $addr % $sector_size == 0,
            "INV-BUF-01 violated: address {:#x} is not aligned to sector size {}",
            $addr,
            $sector_size
        )
    };
}

// =============================================================================
// INV-BUF-02: Valid-Data Length Bound
// =============================================================================

/// Assert that a buffer's valid-data length never exceeds its capacity.
macro_rules! debug_assert_len_in_bounds {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "INV-BUF-02 violated: valid length {} exceeds capacity {}",
            $len,
            $capacity
        )
    };
}

// =============================================================================
// INV-POOL-01: Rented Buffer Starts At Refcount One
// =============================================================================

/// Assert that a freshly rented buffer has exactly one reference.
macro_rules! debug_assert_rent_refcount_one {
    ($refcount:expr) => {
        debug_assert!(
            $refcount == 1,
            "INV-POOL-01 violated: rented buffer has refcount {}, expected 1",
            $refcount
        )
    };
}

// =============================================================================
// INV-POOL-02: Available Count Matches Capacity At Rest
// =============================================================================

/// Assert that, when asserting the pool invariant, every buffer is idle.
macro_rules! debug_assert_pool_at_rest {
    ($available:expr, $capacity:expr) => {
        debug_assert!(
            $available == $capacity,
            "INV-POOL-02 violated: {} of {} buffers available, pool is not at rest",
            $available,
            $capacity
        )
    };
}

// =============================================================================
// INV-POOL-03: Return Never Drives Refcount Negative
// =============================================================================

/// Assert that a return was observed to decrement a strictly positive refcount.
macro_rules! debug_assert_return_from_positive {
    ($prev_refcount:expr) => {
        debug_assert!(
            $prev_refcount > 0,
            "INV-POOL-03 violated: returned a buffer whose refcount was already {}",
            $prev_refcount
        )
    };
}

pub(crate) use debug_assert_len_in_bounds;
pub(crate) use debug_assert_pool_at_rest;
pub(crate) use debug_assert_rent_refcount_one;
pub(crate) use debug_assert_return_from_positive;
pub(crate) use debug_assert_sector_aligned;
