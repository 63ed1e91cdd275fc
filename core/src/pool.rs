//! Fixed-size block pool with an intrusive lock-free free list.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::region::Region;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};

/// Intrusive free-list link stored in the first word of a free block.
///
/// A block is either on the free list (its first word is a `FreeNode`) or
/// handed to a caller, whose contents the pool never inspects.
#[repr(C)]
#[derive(Debug)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Treiber stack threaded through the free blocks themselves.
#[derive(Debug)]
struct FreeList {
    head: AtomicPtr<FreeNode>,
    len: AtomicUsize,
}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Push `block` onto the stack.
    ///
    /// # Safety
    ///
    /// `block` must point to at least a pointer's worth of writable memory
    /// that is not currently on the list.
    unsafe fn push(&self, block: NonNull<u8>) {
        let node = block.as_ptr().cast::<FreeNode>();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: per the contract the block is writable and exclusively
            // ours until the CAS publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop the most recently pushed block, or `None` if the stack is empty.
    fn pop(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(head) {
            // The next link is read before the CAS; the acquire on success
            // pairs with the release of the push that published it.
            let next = unsafe { (*node.as_ptr()).next };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(node.cast());
                }
                Err(current) => head = current,
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// A fixed-size block allocator over one contiguous region.
///
/// Construction carves the region into `block_count` blocks of
/// `block_size` bytes and threads a free list through them so the first
/// allocation returns the lowest-addressed block.
///
/// # Thread safety
///
/// `alloc` and `free` operate on a lock-free Treiber stack. The pop path
/// is ABA-prone under unrestricted concurrent use; the slab layer above
/// avoids this by only popping in bulk under the internal drain lock
/// ([`Pool::alloc_batch`]). Standalone users mixing concurrent raw
/// `alloc`/`free` on the same pool inherit that restriction.
#[derive(Debug)]
pub struct Pool {
    region: Region,
    block_size: usize,
    block_count: usize,
    free: FreeList,
    /// Serializes bulk refill/flush and reset against each other.
    drain: Mutex<()>,
}

impl Pool {
    /// Create a pool of `block_count` blocks of `block_size` bytes each.
    ///
    /// `block_size` is inclusive of the free-list link, so it must be at
    /// least one pointer wide; `block_count` must be nonzero.
    pub fn new(block_size: usize, block_count: usize) -> io::Result<Pool> {
        if block_size < mem::size_of::<*mut u8>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size below the free-list link width",
            ));
        }
        if block_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block count must be nonzero",
            ));
        }
        let bytes = block_size.checked_mul(block_count).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "pool size overflows")
        })?;
        let pool = Pool {
            region: Region::new(bytes)?,
            block_size,
            block_count,
            free: FreeList::new(),
            drain: Mutex::new(()),
        };
        // Safety: the region is exclusively ours during construction.
        unsafe { pool.rebuild_free_list() };
        Ok(pool)
    }

    /// Link every block into the free list, last block first, so pops come
    /// out in ascending address order.
    ///
    /// # Safety
    ///
    /// Requires exclusive access to the pool: no block may be held by a
    /// caller and no concurrent operation may be in flight.
    unsafe fn rebuild_free_list(&self) {
        let base = self.region.as_ptr();
        let mut head: *mut FreeNode = ptr::null_mut();
        for index in (0..self.block_count).rev() {
            // Safety: index * block_size stays within the region.
            let node = unsafe { base.add(index * self.block_size) }.cast::<FreeNode>();
            unsafe { (*node).next = head };
            head = node;
        }
        self.free.head.store(head, Ordering::Release);
        self.free.len.store(self.block_count, Ordering::Relaxed);
    }

    /// Pop a free block, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        self.free.pop()
    }

    /// Return `block` to the free list.
    ///
    /// # Safety
    ///
    /// `block` must have been produced by this pool's `alloc` (or a batch
    /// variant) and must not currently be on the free list. The pool does
    /// not validate ownership; violations are undefined behavior.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        debug_assert!(self.owns(block.as_ptr()));
        unsafe { self.free.push(block) };
    }

    /// Pop up to `max` blocks into `out` under the drain lock.
    ///
    /// Returns the number of blocks transferred. Serializing bulk pops
    /// through this lock is what keeps the pop path ABA-free for the slab
    /// layer.
    pub fn alloc_batch(&self, max: usize, out: &mut Vec<NonNull<u8>>) -> usize {
        let _guard = self.drain.lock();
        let mut moved = 0;
        while moved < max {
            match self.free.pop() {
                Some(block) => {
                    out.push(block);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Push a batch of blocks back onto the free list as one locked
    /// operation.
    ///
    /// # Safety
    ///
    /// Same preconditions as [`Pool::free`], for every block in the batch.
    pub unsafe fn free_batch<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        let _guard = self.drain.lock();
        for block in blocks {
            unsafe { self.free.push(block) };
        }
    }

    /// True iff `ptr` lies inside the pool's block range and is aligned to
    /// a block boundary.
    pub fn owns(&self, ptr: *const u8) -> bool {
        if !self.region.contains(ptr) {
            return false;
        }
        let offset = ptr as usize - self.region.as_ptr() as usize;
        // The region may be page-rounded beyond the last block.
        offset < self.block_size * self.block_count && offset % self.block_size == 0
    }

    /// Free bytes: the free block count times the block size.
    ///
    /// Observational only; not synchronized against in-flight operations.
    pub fn free_space(&self) -> usize {
        self.free.len() * self.block_size
    }

    /// Total bytes served by this pool.
    pub fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }

    /// The configured block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The configured number of blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Return every block to the free list, restoring the initial
    /// fully-free state.
    ///
    /// # Safety
    ///
    /// All outstanding blocks become invalid and must not be touched
    /// again. Callers holding blocks must have quiesced; the slab layer
    /// enforces this through its epoch protocol.
    pub unsafe fn reset(&self) {
        let _guard = self.drain.lock();
        unsafe { self.rebuild_free_list() };
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_blocks() {
        let err = Pool::new(mem::size_of::<*mut u8>() - 1, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_zero_blocks() {
        let err = Pool::new(64, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn first_alloc_is_lowest_address() {
        let pool = Pool::new(64, 8).expect("pool creation failed");
        let first = pool.alloc().expect("alloc failed");
        assert_eq!(first.as_ptr(), pool.region.as_ptr());
        let second = pool.alloc().expect("alloc failed");
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 64);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let pool = Pool::new(128, 10).expect("pool creation failed");

        let mut blocks = Vec::new();
        for _ in 0..10 {
            blocks.push(pool.alloc().expect("alloc failed"));
        }
        assert!(pool.alloc().is_none());

        let mut addrs: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 10, "allocated blocks must be distinct");

        for block in blocks.drain(..) {
            unsafe { pool.free(block) };
        }
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn blocks_are_aligned_and_contained() {
        let pool = Pool::new(96, 5).expect("pool creation failed");
        for _ in 0..5 {
            let block = pool.alloc().expect("alloc failed");
            assert!(pool.owns(block.as_ptr()));
            let offset = block.as_ptr() as usize - pool.region.as_ptr() as usize;
            assert_eq!(offset % 96, 0);
        }
    }

    #[test]
    fn owns_rejects_foreign_and_interior_pointers() {
        let pool = Pool::new(64, 4).expect("pool creation failed");
        let other = Pool::new(64, 4).expect("pool creation failed");

        let block = pool.alloc().expect("alloc failed");
        assert!(pool.owns(block.as_ptr()));
        assert!(!pool.owns(unsafe { block.as_ptr().add(1) }));
        assert!(!other.owns(block.as_ptr()));
        // Page rounding may leave tail bytes in the region that are not
        // block storage.
        assert!(!pool.owns(unsafe { pool.region.as_ptr().add(64 * 4) }));
        unsafe { pool.free(block) };
    }

    #[test]
    fn free_space_accounting() {
        let pool = Pool::new(64, 8).expect("pool creation failed");
        assert_eq!(pool.free_space(), 64 * 8);
        assert_eq!(pool.capacity(), 64 * 8);

        let a = pool.alloc().expect("alloc failed");
        let b = pool.alloc().expect("alloc failed");
        assert_eq!(pool.free_space(), 64 * 6);

        unsafe {
            pool.free(a);
            pool.free(b);
        }
        assert_eq!(pool.free_space(), pool.capacity());
    }

    #[test]
    fn batch_roundtrip() {
        let pool = Pool::new(32, 16).expect("pool creation failed");
        let mut batch = Vec::new();
        assert_eq!(pool.alloc_batch(8, &mut batch), 8);
        assert_eq!(batch.len(), 8);
        assert_eq!(pool.free_space(), 32 * 8);

        // Asking past exhaustion transfers only what is left.
        let mut rest = Vec::new();
        assert_eq!(pool.alloc_batch(100, &mut rest), 8);
        assert!(pool.alloc().is_none());

        unsafe {
            pool.free_batch(batch.drain(..));
            pool.free_batch(rest.drain(..));
        }
        assert_eq!(pool.free_space(), pool.capacity());
    }

    #[test]
    fn reset_restores_full_pool() {
        let pool = Pool::new(64, 8).expect("pool creation failed");
        for _ in 0..8 {
            pool.alloc().expect("alloc failed");
        }
        assert_eq!(pool.free_space(), 0);

        unsafe { pool.reset() };
        assert_eq!(pool.free_space(), pool.capacity());

        let first = pool.alloc().expect("alloc failed");
        assert_eq!(first.as_ptr(), pool.region.as_ptr());
    }

    #[test]
    fn concurrent_churn_restores_free_space() {
        let pool = std::sync::Arc::new(Pool::new(64, 512).expect("pool creation failed"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = std::sync::Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..1_000 {
                    // Batch paths only: the raw pop is reserved for
                    // serialized use.
                    pool.alloc_batch(8, &mut held);
                    unsafe { pool.free_batch(held.drain(..)) };
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(pool.free_space(), pool.capacity());
    }
}
