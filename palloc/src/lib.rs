//! Composable allocators for fixed- and small-object workloads.
//!
//! Three tiers build on one another:
//!
//! ```text
//! +---------------------------------------------------+
//! |                   DynamicSlab                     |
//! |  prepend-only slab list, grows under a mutex      |
//! |  +---------------------------------------------+  |
//! |  | Slab                                        |  |
//! |  |  epoch (reset invalidation)                 |  |
//! |  |  +--------------+  +--------------+         |  |
//! |  |  | Pool 8B      |  | Pool 16B     |  ...    |  |
//! |  |  | free list    |  | free list    |         |  |
//! |  |  +--------------+  +--------------+         |  |
//! |  +---------------------------------------------+  |
//! +---------------------------------------------------+
//!          ^ batched refill / flush
//!          |
//!   per-thread caches (one stack per size class)
//! ```
//!
//! - [`Arena`]: bump allocation with whole-arena reset, for scope-bounded
//!   lifetimes.
//! - [`Pool`]: fixed-size blocks over one region, lock-free free list.
//! - [`Slab`]: one pool per size class in [`SIZE_CLASSES`], fronted by
//!   per-thread caches that batch pool traffic; `reset` invalidates the
//!   caches lazily through an epoch counter.
//! - [`DynamicSlab`]: a lock-free list of slabs that appends a fresh slab
//!   when every existing one is exhausted.
//!
//! Requests above the largest size class are refused rather than served
//! from a general-purpose heap; a `None` return is per-call backpressure.
//!
//! # Example
//!
//! ```
//! use palloc::DynamicSlab;
//!
//! let heap = DynamicSlab::new(1.0)?;
//! let block = heap.palloc(48).expect("fresh heap must serve 48 bytes");
//! // ... use the 64-byte class block ...
//! unsafe { heap.free(block, 48) };
//! # Ok::<(), std::io::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;

mod dynamic;
mod slab;
mod tlc;

pub use config::{
    CLASS_COUNT, MAX_CACHED_SLABS, REFILL_BATCH, SIZE_CLASSES, TLC_CAPACITY, class_size,
    size_to_index,
};
pub use dynamic::DynamicSlab;
pub use slab::{ClassStats, Slab};

pub use palloc_core::{Arena, Pool, Region, page_size};
