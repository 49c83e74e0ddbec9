//! Surface-level checks on the public API shape.

use dmallox::config::Options;
use dmallox::{AllocatorContext, DmallocError, Dmallox};

#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: Dmallox = Dmallox::new();
    static _ALLOCATOR2: Dmallox = Dmallox::new();
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(Dmallox::new())
}

#[test]
fn zero_size_is_rejected_by_default() {
    let ctx = AllocatorContext::new(Options::default());
    assert_eq!(ctx.allocate(0), Err(DmallocError::BadSize));
}

#[test]
fn request_at_exactly_the_largest_class_succeeds_one_byte_over_fails() {
    let ctx = AllocatorContext::new(Options::default());
    // 2^30 is the configured LARGEST_BIT; anything larger must be rejected.
    assert_eq!(ctx.allocate(1 << 30), Err(DmallocError::TooBig));
    assert!(ctx.allocate(1 << 20).is_ok());
}

#[test]
fn half_block_boundary_splits_the_divided_and_block_run_paths() {
    let ctx = AllocatorContext::new(Options::default());
    // Below half a block: divided engine.
    let small = ctx.allocate(2047).unwrap();
    // At or above half a block: block-run index.
    let large = ctx.allocate(2048).unwrap();
    assert!(ctx.check_heap().is_ok());
    ctx.free(small.as_ptr()).unwrap();
    ctx.free(large.as_ptr()).unwrap();
}
