//! Page-backed building blocks for the tiered allocators.
//!
//! This crate owns everything that touches raw memory directly:
//!
//! - [`Region`]: an anonymous, zero-initialized mapping obtained from the
//!   OS, released when dropped. The only component that calls into the
//!   page-mapping primitive.
//! - [`Arena`]: a bump allocator over a single region. No individual free;
//!   `reset` recycles the whole region.
//! - [`Pool`]: a fixed-size block allocator with an intrusive lock-free
//!   free list, plus bulk refill/flush entry points for the size-classed
//!   slab layer built on top (see the `palloc` crate).
//!
//! The `sync` module switches between std and loom atomics so the
//! lock-free paths can be model checked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sync;

mod arena;
mod pool;
mod region;

pub use arena::Arena;
pub use pool::Pool;
pub use region::{Region, page_size};
