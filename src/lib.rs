//! A debugging heap allocator modeled on the classic `dmalloc` library.
//!
//! This crate provides a single type called [`Dmallox`]. It implements the
//! [`std::alloc::GlobalAlloc`] trait, so it can be dropped in as
//! `#[global_allocator]` in any binary, the same way as a production
//! allocator — except every allocation is backed by fence posts, leak and
//! provenance tracking, and an optional transaction log.
//!
//! # Usage
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: dmallox::Dmallox = dmallox::Dmallox::new();
//! ```
//! Configuration is read from the `DMALLOC_OPTIONS` environment variable the
//! first time the allocator is touched (see [`config::Options`]); there is
//! nothing else to wire up.
//!
//! For direct debugging use beyond what `GlobalAlloc` exposes — explicit
//! heap checks, the heap map, leak reports — reach for [`AllocatorContext`]
//! directly:
//! ```
//! use dmallox::AllocatorContext;
//! use dmallox::config::Options;
//!
//! let heap = AllocatorContext::new(Options::parse("check-fence,check-lists"));
//! let p = heap.allocate(64).unwrap();
//! heap.check_heap().unwrap();
//! heap.free(p.as_ptr()).unwrap();
//! ```
//!
//! # Implementation
//! The managed heap is a flat array of BLOCK-sized basic blocks, addressed
//! by index rather than raw pointer so that free lists, user allocations
//! and mini-slot engines never alias into each other's state. Small
//! requests (up to half a block) are carved out of a shared
//! [`divided::DividedBlockEngine`]; everything else is served whole blocks
//! at a time by the [`free_index::FreeBlockIndex`]. Every live user
//! allocation is bracketed by [`fence::FenceGuard`] picket-fence bytes, and
//! every allocation site is aggregated into [`provenance::ProvenanceTable`]
//! for leak and high-water reporting. [`checker::IntegrityChecker`] can walk
//! the whole structure, or just the allocation containing one pointer, on
//! demand.
//!
//! See `DESIGN.md` in the repository root for how each component maps back
//! to the pieces of the original C library, and for the handful of
//! originally-ambiguous behaviors this crate had to pin down one way.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod block;
pub mod caller;
pub mod checker;
pub mod config;
pub mod context;
pub mod core_alloc;
pub mod directory;
pub mod divided;
pub mod error;
pub mod fence;
pub mod free_index;
pub mod heap_map;
pub mod logger;
pub mod page_source;
pub mod provenance;

pub use context::{AllocatorContext, NullFreePolicy, ReallocZeroPolicy};
pub use core_alloc::{Counters, Variant};
pub use error::DmallocError;

use std::alloc::{GlobalAlloc, Layout};
use std::sync::OnceLock;

/// The `#[global_allocator]` entry point.
///
/// Construction is a `const fn` (no I/O, no syscalls) so it can sit in a
/// `static`; the [`AllocatorContext`] underneath is built lazily, on first
/// use, reading `DMALLOC_OPTIONS` at that point. This mirrors the original
/// `dmalloc`'s own lazy-setup-on-first-call behavior, rather than forcing
/// configuration to be read at process startup, before `main` has had a
/// chance to set the environment variable meant for it.
pub struct Dmallox {
    context: OnceLock<AllocatorContext>,
}

impl Dmallox {
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]` attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self {
            context: OnceLock::new(),
        }
    }

    /// The underlying [`AllocatorContext`], initialized from
    /// `DMALLOC_OPTIONS` on first access. Exposed so a `#[global_allocator]`
    /// static can also answer `check-heap`/`log-stats`/etc without standing
    /// up a second allocator alongside it.
    pub fn context(&self) -> &AllocatorContext {
        self.context.get_or_init(AllocatorContext::from_env)
    }
}

impl Default for Dmallox {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: every operation on `AllocatorContext` takes its internal
// `spin::Mutex` gate before touching any shared state (spec §5), so
// `Dmallox` is safe to share across threads despite the lazily-initialized
// `OnceLock` (itself thread-safe).
unsafe impl GlobalAlloc for Dmallox {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.context().allocate(layout.size()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        match self.context().count_and_size_allocate(1, layout.size()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.context().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match self.context().reallocate(ptr, new_size) {
            Ok(p) => p.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_alloc_trait_round_trips_a_block() {
        let allocator = Dmallox::new();
        let layout = Layout::from_size_align(128, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0xAB, 128);
            allocator.dealloc(ptr, layout);
        }
    }

    #[test]
    fn alloc_zeroed_returns_zeroed_memory() {
        let allocator = Dmallox::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            let bytes = std::slice::from_raw_parts(ptr, 64);
            assert!(bytes.iter().all(|&b| b == 0));
            allocator.dealloc(ptr, layout);
        }
    }
}
