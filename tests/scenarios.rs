//! End-to-end scenarios against the fence, provenance, and reuse invariants
//! laid out for the allocator's public operations.

use dmallox::config::Options;
use dmallox::{AllocatorContext, DmallocError};

#[test]
fn s1_transaction_log_and_stats_round_trip_after_free() {
    let ctx = AllocatorContext::new(Options::parse("log-trans,log-stats"));
    let p = ctx.allocate(100).unwrap();
    unsafe { p.as_ptr().write_bytes(0xAB, 100) };
    ctx.free(p.as_ptr()).unwrap();

    let (counters, _) = ctx.read_info();
    assert_eq!(counters.bytes_in_use, 0);
    assert_eq!(counters.points_out, 0);
}

#[test]
fn s2_writing_past_the_chunk_is_caught_by_check_heap() {
    let ctx = AllocatorContext::new(Options::parse("check-fence"));
    // 96 rounds up to an exact power-of-two mini-slot (128 bytes including
    // fence overhead), leaving no slack between the end of the chunk and
    // the top fence tile, so a single out-of-bounds byte always lands on it.
    let p = ctx.allocate(96).unwrap();
    unsafe { p.as_ptr().add(96).write(0) };
    assert_eq!(ctx.check_heap(), Err(DmallocError::OverFence));
}

#[test]
fn s3_double_free_is_rejected() {
    let ctx = AllocatorContext::new(Options::default());
    let p = ctx.allocate(100).unwrap();
    ctx.free(p.as_ptr()).unwrap();
    let second = ctx.free(p.as_ptr());
    assert!(matches!(
        second,
        Err(DmallocError::AlreadyFree) | Err(DmallocError::NotStartBlock) | Err(DmallocError::NotFound)
    ));
}

#[test]
fn s4_freed_block_run_is_recycled_by_the_next_allocations() {
    let ctx = AllocatorContext::new(Options::default());
    let p = ctx.allocate(4096 * 3).unwrap();
    ctx.free(p.as_ptr()).unwrap();
    let q = ctx.allocate(4096 * 2).unwrap();
    let r = ctx.allocate(4096).unwrap();
    assert!(q != r);
    ctx.free(q.as_ptr()).unwrap();
    ctx.free(r.as_ptr()).unwrap();
}

#[test]
fn s5_realloc_copy_flag_controls_whether_the_pointer_moves() {
    let in_place = AllocatorContext::new(Options::default());
    let p = in_place.allocate(10).unwrap();
    let p2 = in_place.reallocate(p.as_ptr(), 20).unwrap();
    let p3 = in_place.reallocate(p2.as_ptr(), 9).unwrap();
    assert_eq!(p, p2);
    assert_eq!(p2, p3);

    let copying = AllocatorContext::new(Options::parse("realloc-copy"));
    let p = copying.allocate(10).unwrap();
    let p2 = copying.reallocate(p.as_ptr(), 4096 * 4).unwrap();
    assert_ne!(p, p2);
}

#[test]
fn s6_log_unfreed_matches_surviving_allocations() {
    let ctx = AllocatorContext::new(Options::parse("log-non-free"));
    let kept = ctx.allocate(48).unwrap();
    let freed = ctx.allocate(32).unwrap();
    ctx.free(freed.as_ptr()).unwrap();

    let (counters, _) = ctx.read_info();
    assert_eq!(counters.bytes_in_use, 48);
    assert_eq!(counters.points_out, 1);
    ctx.free(kept.as_ptr()).unwrap();
}
