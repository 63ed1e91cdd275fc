//! Grow-on-demand wrapper around a list of slabs.

use std::io;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::{self, SIZE_CLASSES};
use crate::slab::Slab;

/// List cell owning one slab.
///
/// `next` is written exactly once, before the node is published through
/// the list head; nodes are never unlinked while the list is live.
struct SlabNode {
    slab: Slab,
    next: AtomicPtr<SlabNode>,
}

/// A set of slabs that grows when every existing slab is exhausted.
///
/// Allocation walks a prepend-only singly linked list of slabs, serving
/// from the first one with a free block; when all are exhausted a new
/// slab (at the constructor's `scale`) is built and published under the
/// grow mutex. Readers traverse lock-free: publication safety comes from
/// the release store of the head paired with acquire loads, and `next`
/// links are immutable once a node is reachable.
///
/// Dropping the wrapper tears down every slab; all threads that used it
/// must have quiesced first, since their caches and outstanding blocks
/// point into the slabs' regions.
pub struct DynamicSlab {
    head: AtomicPtr<SlabNode>,
    node_count: AtomicUsize,
    scale: f64,
    /// Held only while constructing and prepending a new slab.
    grow: Mutex<()>,
}

impl DynamicSlab {
    /// Create the wrapper with one eagerly built slab at `scale`.
    pub fn new(scale: f64) -> io::Result<DynamicSlab> {
        let node = Box::into_raw(Box::new(SlabNode {
            slab: Slab::new(scale)?,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        Ok(DynamicSlab {
            head: AtomicPtr::new(node),
            node_count: AtomicUsize::new(1),
            scale,
            grow: Mutex::new(()),
        })
    }

    /// Allocate `size` bytes from the first slab that can serve it,
    /// growing the list if every existing slab is exhausted.
    ///
    /// Returns `None` for sizes with no class and when growth fails at
    /// the page source; failure is per-call backpressure, never fatal.
    pub fn palloc(&self, size: usize) -> Option<NonNull<u8>> {
        // Reject unservable sizes up front so exhaustion can't trigger
        // pointless growth.
        config::size_to_index(size)?;

        for node in self.nodes() {
            if let Some(block) = node.slab.alloc(size) {
                return Some(block);
            }
        }
        self.grow_then_alloc(size)
    }

    /// Allocate and zero `size` bytes.
    ///
    /// The zeroed range is the rounded-up class size, not just `size`.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = config::size_to_index(size)?;
        let block = self.palloc(size)?;
        unsafe { block.as_ptr().write_bytes(0, SIZE_CLASSES[class]) };
        Some(block)
    }

    /// Return a block to the slab that owns it.
    ///
    /// Sizes with no class are discarded as a defined no-op, as are
    /// pointers no slab in the list owns.
    ///
    /// # Safety
    ///
    /// If some slab owns `block`, the same preconditions as
    /// [`Slab::free`] apply: allocated by this wrapper with a size in the
    /// same class, not already freed, never used afterwards.
    pub unsafe fn free(&self, block: NonNull<u8>, size: usize) {
        if config::size_to_index(size).is_none() {
            return;
        }
        for node in self.nodes() {
            if node.slab.owns(block.as_ptr()) {
                unsafe { node.slab.free(block, size) };
                return;
            }
        }
        // No owner: a misrouted free is silently discarded by contract.
    }

    /// Sum of the capacities of every slab in the list, in bytes.
    pub fn total_capacity(&self) -> usize {
        self.nodes().map(|node| node.slab.total_capacity()).sum()
    }

    /// Sum of the free space of every slab in the list, in bytes.
    pub fn total_free(&self) -> usize {
        self.nodes().map(|node| node.slab.total_free()).sum()
    }

    /// Number of slabs in the list; monotonic over the wrapper's life.
    pub fn slab_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    /// Flush the calling thread's caches for every slab in the list.
    ///
    /// See [`Slab::flush_thread_cache`]; threads do this automatically on
    /// exit.
    pub fn flush_thread_cache(&self) {
        for node in self.nodes() {
            node.slab.flush_thread_cache();
        }
    }

    /// Slow path: double-check under the grow mutex, then build and
    /// publish a fresh slab and serve from it.
    fn grow_then_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let _guard = self.grow.lock();

        // A peer may have grown the list while we waited for the lock.
        for node in self.nodes() {
            if let Some(block) = node.slab.alloc(size) {
                return Some(block);
            }
        }

        let slab = match Slab::new(self.scale) {
            Ok(slab) => slab,
            Err(err) => {
                warn!("dynamic slab growth failed: {err}");
                return None;
            }
        };
        // Serve before publishing: once the node is visible, peers could
        // drain the fresh slab out from under this caller.
        let block = slab.alloc(size);

        let node = Box::into_raw(Box::new(SlabNode {
            slab,
            next: AtomicPtr::new(self.head.load(Ordering::Relaxed)),
        }));
        // Publish: the release store makes the node (and its slab) visible
        // to every later acquire load of the head.
        self.head.store(node, Ordering::Release);
        let count = self.node_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("dynamic slab grew to {count} slabs");

        block
    }

    fn nodes(&self) -> Nodes<'_> {
        Nodes {
            node: self.head.load(Ordering::Acquire),
            _list: PhantomData,
        }
    }
}

impl Drop for DynamicSlab {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // Safety: nodes are created by Box::into_raw and only freed
            // here.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

/// Lock-free traversal over the published nodes.
struct Nodes<'a> {
    node: *const SlabNode,
    _list: PhantomData<&'a DynamicSlab>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a SlabNode;

    fn next(&mut self) -> Option<&'a SlabNode> {
        // Safety: a non-null node was published with release ordering and
        // stays alive for the list's lifetime.
        let node = unsafe { self.node.as_ref() }?;
        // Relaxed is enough: next was written before the node became
        // reachable, and reachability came through an acquire load.
        self.node = node.next.load(Ordering::Relaxed);
        Some(node)
    }
}
