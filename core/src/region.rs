//! Anonymous page-backed memory regions.
//!
//! A [`Region`] is the backing store of every allocator in this workspace.
//! On unix targets it is an `mmap(MAP_PRIVATE | MAP_ANONYMOUS)` mapping,
//! which the kernel hands out zero-filled; elsewhere it falls back to the
//! process allocator with explicit zeroing. The mapping is released when
//! the region is dropped.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Regions at or above this size get a transparent-hugepage hint.
#[cfg(target_os = "linux")]
const HUGEPAGE_HINT_THRESHOLD: usize = 2 * 1024 * 1024;

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// Round `size` up to the nearest multiple of `align`.
///
/// `align` must be a power of two.
pub(crate) fn round_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// A contiguous, zero-initialized, read-write byte range obtained from the
/// page source.
///
/// Invariants: the base address is page-aligned and the length is a
/// positive multiple of the page size. The region exclusively owns its
/// mapping and unmaps it on drop.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region is raw memory with a stable address; all access
// discipline is imposed by the allocators layered on top.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve a region of at least `len` bytes, rounded up to the page
    /// size.
    ///
    /// Fails with `InvalidInput` for `len == 0` and with the OS error if
    /// the mapping cannot be established.
    pub fn new(len: usize) -> io::Result<Region> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map zero bytes",
            ));
        }
        let len = round_up(len, page_size());
        let ptr = map_anonymous(len)?;
        Ok(Region { ptr, len })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes (after page rounding).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a region is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff `ptr` lies inside `[base, base + len)`.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr - base < self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unmap(self.ptr, self.len);
    }
}

#[cfg(unix)]
fn map_anonymous(len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // Best-effort THP hint for large regions.
    #[cfg(target_os = "linux")]
    if len >= HUGEPAGE_HINT_THRESHOLD {
        unsafe {
            let _ = libc::madvise(ptr, len, libc::MADV_HUGEPAGE);
        }
    }

    // Safety: mmap returned a non-MAP_FAILED pointer, which is non-null.
    Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
}

#[cfg(unix)]
fn unmap(ptr: NonNull<u8>, len: usize) {
    let result = unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) };
    debug_assert_eq!(result, 0, "munmap failed");
}

#[cfg(not(unix))]
fn map_anonymous(len: usize) -> io::Result<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(len, page_size())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping too large"))?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))
}

#[cfg(not(unix))]
fn unmap(ptr: NonNull<u8>, len: usize) {
    let layout = std::alloc::Layout::from_size_align(len, page_size())
        .expect("layout was valid at construction");
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}
