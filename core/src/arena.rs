//! Bump allocator over a single page-backed region.

use std::io;
use std::ptr::NonNull;

use crate::region::{Region, round_up};
use crate::sync::{AtomicBool, AtomicUsize, Ordering};

/// Alignment unit for every arena allocation.
///
/// Matches `max_align_t` on the supported 64-bit targets, so any scalar
/// can live at the returned address.
const MAX_ALIGN: usize = 16;

/// A bump allocator with scope-bounded lifetime semantics.
///
/// Allocations advance a cursor through one region; there is no individual
/// free. [`Arena::reset`] rewinds the cursor, invalidating every pointer
/// handed out before the reset; callers must not touch them afterwards.
///
/// The cursor is atomic, so an arena can be shared across threads.
/// `reset` concurrent with `alloc` is caller misuse: the reset contract
/// requires the callers to have quiesced first.
pub struct Arena {
    region: Region,
    used: AtomicUsize,
    /// False once the arena has been reset; fresh mappings are
    /// kernel-zeroed, so `calloc` can skip its memset until then.
    pristine: AtomicBool,
}

impl Arena {
    /// Create an arena with at least `capacity` bytes, rounded up to the
    /// page size.
    pub fn new(capacity: usize) -> io::Result<Arena> {
        let region = Region::new(capacity)?;
        Ok(Arena {
            region,
            used: AtomicUsize::new(0),
            pristine: AtomicBool::new(true),
        })
    }

    /// Allocate `len` bytes, aligned to the platform's maximum scalar
    /// alignment.
    ///
    /// Returns `None` for `len == 0` or when the remaining capacity is
    /// insufficient. Failure never poisons the arena.
    pub fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        if len == 0 {
            return None;
        }
        let need = round_up(len, MAX_ALIGN);
        let capacity = self.region.len();
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let end = used.checked_add(need)?;
            if end > capacity {
                return None;
            }
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                // Safety: used < capacity, so the sum stays inside the mapping.
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(self.region.as_ptr().add(used)) }),
                Err(current) => used = current,
            }
        }
    }

    /// Allocate `len` bytes and zero them.
    ///
    /// While the arena has never been reset the range is already
    /// kernel-zeroed and the memset is skipped.
    pub fn calloc(&self, len: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(len)?;
        if !self.pristine.load(Ordering::Relaxed) {
            unsafe { ptr.as_ptr().write_bytes(0, len) };
        }
        Some(ptr)
    }

    /// Rewind the cursor to zero, recycling the whole region.
    ///
    /// Every pointer returned before the reset becomes invalid; callers
    /// must not dereference them.
    pub fn reset(&self) {
        self.pristine.store(false, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
    }

    /// Bytes consumed so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Total usable bytes (the page-rounded region length).
    pub fn capacity(&self) -> usize {
        self.region.len()
    }
}
