//! Per-thread caches of free blocks, one bounded stack per size class.
//!
//! Every thread owns a small registry mapping slab identities to cache
//! entries. The hot paths ([`alloc`] and [`free`]) touch only the calling
//! thread's state; the pools are reached in batches of
//! [`REFILL_BATCH`](crate::config::REFILL_BATCH) under each pool's drain
//! lock, which amortizes the synchronization cost.
//!
//! Invalidation is epoch-based: each class stack mirrors the slab epoch
//! it was populated at, and a mismatch (the slab was reset) silently
//! empties the stack without returning anything to the pool.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use log::trace;

use crate::config::{CLASS_COUNT, MAX_CACHED_SLABS, REFILL_BATCH, TLC_CAPACITY};
use crate::slab::SlabShared;

/// Cached free blocks of a single size class.
struct ClassCache {
    blocks: Vec<NonNull<u8>>,
    /// Slab epoch at which `blocks` was last populated.
    epoch: u64,
}

impl ClassCache {
    fn new() -> ClassCache {
        ClassCache {
            blocks: Vec::new(),
            epoch: 0,
        }
    }

    /// Drop cached blocks that a reset invalidated and adopt the current
    /// epoch.
    #[inline]
    fn sync_epoch(&mut self, current: u64) {
        if self.epoch != current {
            self.blocks.clear();
            self.epoch = current;
        }
    }
}

/// One thread's cache for one slab.
struct SlabCache {
    /// Slab identity: the address of its shared state. Stable while this
    /// entry exists, because the `Weak` below pins the allocation.
    key: usize,
    slab: Weak<SlabShared>,
    classes: [ClassCache; CLASS_COUNT],
    last_used: u64,
}

impl SlabCache {
    /// Return every still-valid cached block to its pool; stale or
    /// orphaned blocks are discarded.
    fn drain(&mut self) {
        let Some(shared) = self.slab.upgrade() else {
            // The slab is gone and its regions are unmapped; the cached
            // pointers are dead and must not be touched.
            for cache in &mut self.classes {
                cache.blocks.clear();
            }
            return;
        };
        let epoch = shared.epoch();
        for (class, cache) in self.classes.iter_mut().enumerate() {
            if cache.epoch != epoch {
                cache.blocks.clear();
                continue;
            }
            if !cache.blocks.is_empty() {
                // Safety: the blocks came from this pool via alloc_batch
                // and epoch equality says no reset reclaimed them since.
                unsafe { shared.pool(class).free_batch(cache.blocks.drain(..)) };
            }
        }
    }
}

/// Registry of the calling thread's slab caches, LRU-bounded.
struct Registry {
    slabs: Vec<SlabCache>,
    tick: u64,
}

impl Registry {
    const fn new() -> Registry {
        Registry {
            slabs: Vec::new(),
            tick: 0,
        }
    }

    /// Look up (or install) the cache entry for `shared`.
    fn entry(&mut self, shared: &Arc<SlabShared>) -> &mut SlabCache {
        let key = Arc::as_ptr(shared) as usize;
        self.tick += 1;
        let tick = self.tick;

        if let Some(index) = self.slabs.iter().position(|entry| entry.key == key) {
            self.slabs[index].last_used = tick;
            return &mut self.slabs[index];
        }

        if self.slabs.len() == MAX_CACHED_SLABS {
            let lru = self
                .slabs
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(index, _)| index)
                .unwrap_or(0);
            let mut evicted = self.slabs.swap_remove(lru);
            trace!("evicting thread cache for slab {:#x}", evicted.key);
            evicted.drain();
        }

        self.slabs.push(SlabCache {
            key,
            slab: Arc::downgrade(shared),
            classes: std::array::from_fn(|_| ClassCache::new()),
            last_used: tick,
        });
        let end = self.slabs.len() - 1;
        &mut self.slabs[end]
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Thread exit: hand every parked block back to its slab.
        for entry in &mut self.slabs {
            entry.drain();
        }
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = const { RefCell::new(Registry::new()) };
}

/// Allocate a class block through the calling thread's cache.
pub(crate) fn alloc(shared: &Arc<SlabShared>, class: usize) -> Option<NonNull<u8>> {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let entry = registry.entry(shared);
        let cache = &mut entry.classes[class];
        // The epoch is sampled before the refill: if a reset slips in
        // between, the mismatch is caught on the next cache operation.
        cache.sync_epoch(shared.epoch());

        if let Some(block) = cache.blocks.pop() {
            return Some(block);
        }
        if shared.pool(class).alloc_batch(REFILL_BATCH, &mut cache.blocks) == 0 {
            return None;
        }
        cache.blocks.pop()
    })
}

/// Return a class block through the calling thread's cache.
pub(crate) fn free(shared: &Arc<SlabShared>, class: usize, block: NonNull<u8>) {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let entry = registry.entry(shared);
        let cache = &mut entry.classes[class];
        cache.sync_epoch(shared.epoch());

        if cache.blocks.len() == TLC_CAPACITY {
            // Flush the oldest batch in one locked operation, keeping the
            // hottest blocks on top of the stack.
            // Safety: cached blocks are valid per the epoch check above.
            unsafe {
                shared
                    .pool(class)
                    .free_batch(cache.blocks.drain(..REFILL_BATCH));
            }
        }
        cache.blocks.push(block);
    })
}

/// Drop the calling thread's cache entry for `shared`, draining valid
/// blocks back to the pools.
pub(crate) fn flush(shared: &Arc<SlabShared>) {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let key = Arc::as_ptr(shared) as usize;
        if let Some(index) = registry.slabs.iter().position(|entry| entry.key == key) {
            let mut entry = registry.slabs.swap_remove(index);
            entry.drain();
        }
    })
}
