//! Size-classed slab allocator with epoch-based reset.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use palloc_core::Pool;

use crate::config::{self, BASELINE_BLOCKS, SIZE_CLASSES};
use crate::tlc;

/// State shared between a [`Slab`] handle and the thread-local caches
/// that reference it.
///
/// The caches hold this through a `Weak`, so a cache outliving its slab
/// discards its pointers instead of draining into unmapped memory.
pub(crate) struct SlabShared {
    /// One pool per size class, in class order.
    pools: Vec<Pool>,
    /// Bumped on every reset; caches compare their mirrored value and
    /// silently empty themselves on mismatch.
    epoch: AtomicU64,
}

impl SlabShared {
    #[inline]
    pub(crate) fn pool(&self, class: usize) -> &Pool {
        &self.pools[class]
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Per-class statistics snapshot.
#[derive(Debug, Clone)]
pub struct ClassStats {
    /// Index of the class in [`SIZE_CLASSES`].
    pub class: usize,
    /// Block size in bytes.
    pub block_size: usize,
    /// Total number of blocks in the class's pool.
    pub block_count: usize,
    /// Free bytes currently on the pool's free list (blocks parked in
    /// thread caches count as allocated).
    pub free_bytes: usize,
}

/// A size-classed allocator: one fixed-size [`Pool`] per class, fronted
/// by per-thread caches that batch traffic against the pools.
///
/// `alloc`/`free` take no locks on the common path: they pop and push the
/// calling thread's cache, falling back to a batched, lock-serialized
/// exchange with the class pool. [`Slab::reset`] recycles every pool and
/// invalidates all caches lazily through the epoch counter.
///
/// Cloning the handle is cheap; clones share the same pools.
#[derive(Clone)]
pub struct Slab {
    shared: Arc<SlabShared>,
}

impl Slab {
    /// Create a slab whose per-class pools hold `ceil(baseline * scale)`
    /// blocks.
    ///
    /// `scale` must be a positive finite multiplier; values below 1.0
    /// shrink the slab (every class keeps at least one block).
    pub fn new(scale: f64) -> io::Result<Slab> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "scale must be a positive finite multiplier",
            ));
        }
        let mut pools = Vec::with_capacity(config::CLASS_COUNT);
        for (index, &size) in SIZE_CLASSES.iter().enumerate() {
            let blocks = scaled_blocks(BASELINE_BLOCKS[index], scale);
            pools.push(Pool::new(size, blocks)?);
        }
        Ok(Slab {
            shared: Arc::new(SlabShared {
                pools,
                epoch: AtomicU64::new(0),
            }),
        })
    }

    /// Allocate a block for `size` bytes from the matching size class.
    ///
    /// Returns `None` for `size == 0`, sizes above the largest class, or
    /// when the class's pool is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = config::size_to_index(size)?;
        tlc::alloc(&self.shared, class)
    }

    /// Allocate and zero a block for `size` bytes.
    ///
    /// The whole class block is zeroed, not just the requested prefix.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = config::size_to_index(size)?;
        let block = tlc::alloc(&self.shared, class)?;
        unsafe { block.as_ptr().write_bytes(0, SIZE_CLASSES[class]) };
        Some(block)
    }

    /// Return a block to the slab.
    ///
    /// The block lands in the calling thread's cache and reaches the
    /// class pool on the next batch flush, so cross-thread frees are
    /// valid. Sizes with no class are discarded as a defined no-op.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `alloc`/`calloc` on this slab
    /// with a size mapping to the same class, must not have been freed
    /// already, and must not be used after this call. Blocks from before
    /// the most recent [`Slab::reset`] are invalid.
    pub unsafe fn free(&self, block: NonNull<u8>, size: usize) {
        let Some(class) = config::size_to_index(size) else {
            return;
        };
        tlc::free(&self.shared, class, block);
    }

    /// True iff `ptr` lies in one of the slab's pools, aligned to a block
    /// boundary.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.shared.pools.iter().any(|pool| pool.owns(ptr))
    }

    /// Recycle every pool to the fully-free state.
    ///
    /// Outstanding blocks become invalid by contract. Thread caches are
    /// not touched here; each one notices the epoch change on its next
    /// access and empties itself. Concurrent allocations racing the reset
    /// may be handed a recycled block; quiesce allocating threads around
    /// a reset if that matters.
    pub fn reset(&self) {
        self.shared.epoch.fetch_add(1, Ordering::Release);
        for pool in &self.shared.pools {
            // Safety: the epoch bump above invalidates cached blocks, and
            // caller-held blocks are dead per the reset contract.
            unsafe { pool.reset() };
        }
    }

    /// Flush the calling thread's cache for this slab back to the pools.
    ///
    /// Threads do this automatically on exit; call it explicitly to
    /// return parked blocks early (e.g. before reading
    /// [`Slab::total_free`] in tests or between workload phases).
    pub fn flush_thread_cache(&self) {
        tlc::flush(&self.shared);
    }

    /// Sum of all per-class pool capacities, in bytes.
    pub fn total_capacity(&self) -> usize {
        self.shared.pools.iter().map(Pool::capacity).sum()
    }

    /// Sum of all per-class pool free space, in bytes.
    ///
    /// Blocks parked in thread caches count as allocated until flushed.
    pub fn total_free(&self) -> usize {
        self.shared.pools.iter().map(Pool::free_space).sum()
    }

    /// Statistics for one size class, or `None` if out of range.
    pub fn class_stats(&self, class: usize) -> Option<ClassStats> {
        let pool = self.shared.pools.get(class)?;
        Some(ClassStats {
            class,
            block_size: pool.block_size(),
            block_count: pool.block_count(),
            free_bytes: pool.free_space(),
        })
    }
}

/// Apply the scale multiplier to a baseline block count.
fn scaled_blocks(baseline: usize, scale: f64) -> usize {
    let scaled = (baseline as f64 * scale).ceil();
    (scaled as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CLASS_COUNT, REFILL_BATCH};

    #[test]
    fn rejects_bad_scale() {
        assert!(Slab::new(0.0).is_err());
        assert!(Slab::new(-1.0).is_err());
        assert!(Slab::new(f64::NAN).is_err());
        assert!(Slab::new(f64::INFINITY).is_err());
    }

    #[test]
    fn small_scale_keeps_every_class_alive() {
        let slab = Slab::new(0.0001).expect("slab creation failed");
        for class in 0..CLASS_COUNT {
            let stats = slab.class_stats(class).expect("missing class");
            assert!(stats.block_count >= 1);
        }
    }

    #[test]
    fn invalid_sizes_fail() {
        let slab = Slab::new(1.0).expect("slab creation failed");
        assert!(slab.alloc(0).is_none());
        assert!(slab.alloc(4097).is_none());
        assert!(slab.calloc(0).is_none());
    }

    #[test]
    fn alloc_routes_to_the_rounded_class() {
        let slab = Slab::new(1.0).expect("slab creation failed");

        let block = slab.alloc(33).expect("alloc failed");
        assert!(slab.owns(block.as_ptr()));

        // 33 rounds up to the 64-byte class; the refill batch should have
        // been pulled from that pool and no other.
        let class = config::size_to_index(33).expect("33 has a class");
        assert_eq!(SIZE_CLASSES[class], 64);
        let stats = slab.class_stats(class).expect("missing class");
        assert_eq!(
            stats.free_bytes,
            (stats.block_count - REFILL_BATCH) * stats.block_size
        );
        for other in (0..CLASS_COUNT).filter(|&c| c != class) {
            let stats = slab.class_stats(other).expect("missing class");
            assert_eq!(stats.free_bytes, stats.block_count * stats.block_size);
        }

        unsafe { slab.free(block, 33) };
    }

    #[test]
    fn same_class_blocks_are_distinct() {
        let slab = Slab::new(1.0).expect("slab creation failed");
        let mut addrs = Vec::new();
        for _ in 0..200 {
            let block = slab.alloc(32).expect("alloc failed");
            addrs.push(block.as_ptr() as usize);
        }
        let count = addrs.len();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), count);
    }

    #[test]
    fn calloc_zeroes_the_class_block() {
        let slab = Slab::new(1.0).expect("slab creation failed");

        // Dirty a block, free it, then calloc until the dirty block comes
        // back around through the thread cache.
        let block = slab.alloc(100).expect("alloc failed");
        unsafe { block.as_ptr().write_bytes(0xAB, 128) };
        unsafe { slab.free(block, 100) };

        let block = slab.calloc(100).expect("calloc failed");
        for offset in 0..128 {
            assert_eq!(unsafe { *block.as_ptr().add(offset) }, 0);
        }
        unsafe { slab.free(block, 100) };
    }

    #[test]
    fn flush_restores_total_free() {
        let slab = Slab::new(1.0).expect("slab creation failed");
        assert_eq!(slab.total_free(), slab.total_capacity());

        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(slab.alloc(16).expect("alloc failed"));
        }
        for block in held.drain(..) {
            unsafe { slab.free(block, 16) };
        }
        // Everything is back, but some of it is parked in this thread's
        // cache until flushed.
        assert!(slab.total_free() < slab.total_capacity());

        slab.flush_thread_cache();
        assert_eq!(slab.total_free(), slab.total_capacity());
    }

    #[test]
    fn reset_recovers_capacity_and_invalidates_cache() {
        let slab = Slab::new(0.05).expect("slab creation failed");
        let class = config::size_to_index(32).expect("32 has a class");
        let blocks = slab.class_stats(class).expect("missing class").block_count;

        // Drain the 32-byte class completely.
        let mut held = Vec::new();
        while let Some(block) = slab.alloc(32) {
            held.push(block);
        }
        assert_eq!(held.len(), blocks);

        slab.reset();
        held.clear();

        // The stale thread cache is discarded via the epoch check and the
        // class serves its full population again.
        let mut again = Vec::new();
        while let Some(block) = slab.alloc(32) {
            again.push(block.as_ptr() as usize);
        }
        assert_eq!(again.len(), blocks);
        again.sort_unstable();
        again.dedup();
        assert_eq!(again.len(), blocks);
    }

    #[test]
    fn epoch_survives_multiple_resets() {
        let slab = Slab::new(0.01).expect("slab creation failed");
        for _ in 0..5 {
            let block = slab.alloc(64).expect("alloc failed");
            unsafe { slab.free(block, 64) };
            slab.reset();
        }
        assert!(slab.alloc(64).is_some());
    }

    #[test]
    fn capacity_matches_scaled_baselines() {
        let slab = Slab::new(2.0).expect("slab creation failed");
        let expected: usize = SIZE_CLASSES
            .iter()
            .zip(BASELINE_BLOCKS.iter())
            .map(|(&size, &baseline)| size * scaled_blocks(baseline, 2.0))
            .sum();
        assert_eq!(slab.total_capacity(), expected);
    }
}
