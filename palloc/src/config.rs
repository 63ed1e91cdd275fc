//! Size classes and tuning constants.

/// Ordered size classes served by the slab, in bytes.
///
/// Requests round up to the smallest class that fits; anything above the
/// largest class is rejected rather than forwarded to a general-purpose
/// heap.
pub const SIZE_CLASSES: [usize; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Number of size classes.
pub const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Baseline block count per class at `scale = 1.0`.
///
/// Chosen so the small classes common in fixed-object workloads stay
/// within a single slab; roughly 2 MiB of block storage in total.
pub(crate) const BASELINE_BLOCKS: [usize; CLASS_COUNT] =
    [8192, 8192, 4096, 4096, 2048, 1024, 512, 256, 128, 64];

/// Blocks moved between a thread cache and its pool in one batch.
///
/// Larger batches reduce pool contention but increase per-thread memory
/// held outside the pool (and wasted on a reset).
pub const REFILL_BATCH: usize = 64;

/// Capacity of each per-class thread-cache stack.
pub const TLC_CAPACITY: usize = 128;

/// Maximum number of slabs a single thread keeps caches for; beyond this
/// the least-recently-used cache is flushed back to its slab.
pub const MAX_CACHED_SLABS: usize = 4;

/// Find the smallest size class that fits `size`.
///
/// Returns `None` for `size == 0` or sizes above the largest class.
#[inline]
pub fn size_to_index(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    match SIZE_CLASSES.binary_search(&size) {
        Ok(index) => Some(index),
        Err(index) if index < CLASS_COUNT => Some(index),
        Err(_) => None,
    }
}

/// The block size of class `index`, or `None` if out of range.
#[inline]
pub fn class_size(index: usize) -> Option<usize> {
    SIZE_CLASSES.get(index).copied()
}
