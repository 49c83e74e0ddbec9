//! Allocation core (spec.md §4.6): `allocate`/`free`/`reallocate` built on
//! top of the page source, block directory, free-block index, divided-block
//! engine, fence guard and provenance table.

use crate::block::{OverheadRecord, Payload};
use crate::caller::CallerKey;
use crate::directory::BlockDirectory;
use crate::divided::DividedBlockEngine;
use crate::error::DmallocError;
use crate::fence::FenceGuard;
use crate::free_index::{FreeBlockIndex, SelectionPolicy};
use crate::page_source::PageSource;
use crate::provenance::ProvenanceTable;
use std::ptr::NonNull;

/// Which public entry point produced a request (spec.md §4.6/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Malloc,
    Calloc,
    ReallocSide,
    /// Page- (i.e. whole-block-) aligned, the "Valloc" variant.
    Valloc,
    /// Arbitrary alignment, capped at one basic block.
    Memalign(usize),
}

/// Process-wide counters (spec.md §3 "Counters").
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub bytes_in_use: u64,
    pub bytes_total: u64,
    pub bytes_peak: u64,
    pub bytes_peak_one: u64,
    pub points_out: u64,
    pub points_ever: u64,
    pub call_malloc: u64,
    pub call_calloc: u64,
    pub call_realloc: u64,
    pub call_free: u64,
    pub check_count: u64,
}

impl Counters {
    fn note_allocation(&mut self, size: u64) {
        self.bytes_in_use += size;
        self.bytes_total += size;
        self.bytes_peak = self.bytes_peak.max(self.bytes_in_use);
        self.bytes_peak_one = self.bytes_peak_one.max(size);
        self.points_out += 1;
        self.points_ever += 1;
    }

    fn note_free(&mut self, size: u64) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(size);
        self.points_out = self.points_out.saturating_sub(1);
    }
}

/// Everything the allocation core needs to answer `allocate`/`free`/
/// `reallocate` on its own, bundled so `AllocatorContext` only has to add the
/// gate and configuration plumbing around it.
pub struct AllocationCore {
    block_size: usize,
    largest_bit: u32,
    source: PageSource,
    directory: BlockDirectory,
    free_index: FreeBlockIndex,
    divided: DividedBlockEngine,
    fence: FenceGuard,
    provenance: ProvenanceTable,
    counters: Counters,
    iteration: u64,

    pub allow_zero_size: bool,
    pub fill_byte: Option<u8>,
    pub poison_byte: Option<u8>,
    pub realloc_always_copy: bool,
    pub record_monotonics: bool,
}

/// What `free`/`reallocate` found at a user pointer, before anything is
/// mutated.
struct Resolved {
    block: crate::block::BlockIndex,
    chunk: NonNull<u8>,
    chunk_len: usize,
    size: usize,
    caller: CallerKey,
    divided_slot: Option<crate::divided::SlotRef>,
    page_aligned: bool,
}

impl AllocationCore {
    pub fn new(
        block_size: usize,
        smallest_bit: u32,
        largest_bit: u32,
        entries_per_page: u32,
        fence: FenceGuard,
        policy: SelectionPolicy,
        memory_table_size: usize,
    ) -> Self {
        Self {
            block_size,
            largest_bit,
            source: PageSource::new(block_size),
            directory: BlockDirectory::new(block_size, entries_per_page),
            free_index: FreeBlockIndex::new(block_size, largest_bit, policy),
            divided: DividedBlockEngine::new(block_size, smallest_bit),
            fence,
            provenance: ProvenanceTable::new(memory_table_size),
            counters: Counters::default(),
            iteration: 0,
            allow_zero_size: false,
            fill_byte: None,
            poison_byte: None,
            realloc_always_copy: false,
            record_monotonics: false,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn directory(&self) -> &BlockDirectory {
        &self.directory
    }

    pub fn free_index(&self) -> &FreeBlockIndex {
        &self.free_index
    }

    pub fn divided(&self) -> &DividedBlockEngine {
        &self.divided
    }

    pub fn fence(&self) -> &FenceGuard {
        &self.fence
    }

    pub fn set_delayed_reuse(&mut self, delay: u64) {
        self.free_index.set_delayed_reuse(delay);
        self.divided.set_delayed_reuse(delay);
    }

    pub fn set_never_reuse(&mut self, never: bool) {
        self.free_index.set_never_reuse(never);
    }

    fn bump_iteration(&mut self) -> u64 {
        self.iteration += 1;
        self.iteration
    }

    fn required_block_class(&self, inflated: usize) -> u32 {
        ceil_log2(inflated.max(1) as u64)
    }

    /// `allocate(file, line, size, variant)` (spec.md §4.6).
    pub fn allocate(
        &mut self,
        size: usize,
        variant: Variant,
        caller: CallerKey,
    ) -> Result<NonNull<u8>, DmallocError> {
        if size == 0 && !self.allow_zero_size {
            return Err(DmallocError::BadSize);
        }
        match variant {
            Variant::Calloc => self.counters.call_calloc += 1,
            _ => self.counters.call_malloc += 1,
        }

        let overhead = self.fence.overhead();
        let inflated = size + overhead;
        // A `Memalign(a)` request is satisfied by picking a size class (or
        // block run) at least as large as the requested alignment: every
        // divided-block slot of class `2^b` sits at a `2^b`-aligned offset
        // from its (block-size-aligned) block base, and every block run
        // starts on a block boundary, so bumping the class floor to `a`
        // before routing is sufficient. This does not hold once `F_BOT`
        // shifts the user pointer away from the chunk start; see
        // `DESIGN.md` for the documented limit on `check-fence` + memalign.
        let align_floor = match variant {
            Variant::Memalign(alignment) if alignment > 1 => alignment,
            _ => 1,
        };
        let class_floor = inflated.max(align_floor);

        let (user_ptr, run_len) = if variant == Variant::Valloc {
            self.allocate_page_aligned(size)?
        } else if class_floor <= self.block_size / 2 {
            self.allocate_divided(size, caller, align_floor)?
        } else {
            self.allocate_block_run(size, variant, class_floor)?
        };

        let iteration = self.bump_iteration();
        let overhead_record =
            OverheadRecord::capture(self.seen_count(&caller), iteration, self.record_monotonics);
        self.finish_block_allocation(user_ptr, run_len, size, caller, overhead_record, variant)?;

        if variant == Variant::Calloc {
            // SAFETY: `user_ptr` is valid for `size` writes, just carved.
            unsafe { user_ptr.as_ptr().write_bytes(0, size) };
        } else if let Some(fill) = self.fill_byte {
            // SAFETY: same as above.
            unsafe { user_ptr.as_ptr().write_bytes(fill, size) };
        }

        self.provenance.insert(caller, size);
        self.counters.note_allocation(size as u64 + overhead as u64);
        Ok(user_ptr)
    }

    fn seen_count(&self, caller: &CallerKey) -> u32 {
        self.provenance.in_use_for(caller).count_ever as u32
    }

    /// Divided path: returns `(user_ptr, 0)`; `run_len` is meaningless here
    /// (divided blocks aren't addressed by block run) but kept for a uniform
    /// return shape with the block-run path.
    fn allocate_divided(
        &mut self,
        size: usize,
        _caller: CallerKey,
        min_alignment: usize,
    ) -> Result<(NonNull<u8>, u32), DmallocError> {
        let inflated = (size + self.fence.overhead()).max(min_alignment);
        let iteration = self.iteration;
        let (chunk_ptr, _slot_ref) = self.divided.allocate(
            &mut self.directory,
            &mut self.free_index,
            &mut self.source,
            inflated,
            iteration,
        )?;
        // SAFETY: `chunk_ptr` is the fresh slot just carved/reused.
        unsafe { self.fence.write(chunk_ptr.as_ptr(), slot_len(&self.directory, chunk_ptr)) };
        let user_ptr = unsafe { self.fence.user_ptr(chunk_ptr.as_ptr()) };
        Ok((NonNull::new(user_ptr).expect("fence offset from a non-null base"), 0))
    }

    fn allocate_block_run(
        &mut self,
        size: usize,
        _variant: Variant,
        inflated: usize,
    ) -> Result<(NonNull<u8>, u32), DmallocError> {
        let bit = self.required_block_class(inflated);
        if bit > self.largest_bit {
            return Err(DmallocError::TooBig);
        }
        let n = ((inflated + self.block_size - 1) / self.block_size).max(1) as u32;
        let block = self.free_index.allocate(
            &mut self.directory,
            &mut self.source,
            n,
            self.iteration,
        )?;
        let raw = self.directory.address_of(block);
        let chunk_len = n as usize * self.block_size;
        // SAFETY: `raw` addresses `n` freshly reserved/recycled blocks.
        unsafe { self.fence.write(raw as *mut u8, chunk_len) };
        let user_ptr = unsafe { self.fence.user_ptr(raw as *mut u8) };
        Ok((NonNull::new(user_ptr).expect("fence offset from a non-null base"), n))
    }

    /// Page-aligned path (spec.md §4.6 "Page-aligned-with-fence"): reserves
    /// one extra leading block so the bottom fence doesn't break alignment.
    fn allocate_page_aligned(&mut self, size: usize) -> Result<(NonNull<u8>, u32), DmallocError> {
        let bot = self.fence.bottom_len();
        let top = self.fence.top_len();
        let tail_bit = self.required_block_class(size + top);
        if tail_bit > self.largest_bit {
            return Err(DmallocError::TooBig);
        }
        let tail_blocks = ((size + top + self.block_size - 1) / self.block_size).max(1) as u32;
        let n = tail_blocks + 1;
        let block = self.free_index.allocate(
            &mut self.directory,
            &mut self.source,
            n,
            self.iteration,
        )?;
        let raw = self.directory.address_of(block);
        let chunk = (raw + self.block_size) - bot;
        let chunk_len = bot + size + top;
        // SAFETY: `chunk..chunk+chunk_len` lies entirely within the `n`
        // freshly reserved blocks (bot <= block_size by construction).
        unsafe { self.fence.write(chunk as *mut u8, chunk_len) };
        let user_ptr = raw + self.block_size;
        Ok((
            NonNull::new(user_ptr as *mut u8).expect("block base is never null"),
            n,
        ))
    }

    fn finish_block_allocation(
        &mut self,
        user_ptr: NonNull<u8>,
        run_len: u32,
        size: usize,
        caller: CallerKey,
        overhead: OverheadRecord,
        variant: Variant,
    ) -> Result<(), DmallocError> {
        if run_len == 0 {
            // divided path: descriptor/slot state was already set up by
            // `DividedBlockEngine::allocate`; just record provenance.
            let chunk = unsafe { self.fence.chunk_ptr(user_ptr.as_ptr()) };
            let block = self
                .directory
                .find(chunk as usize)
                .ok_or(DmallocError::NotInHeap)?;
            let slot_ref = self.divided.resolve(
                &self.directory,
                block,
                NonNull::new(chunk).expect("chunk ptr from a non-null user ptr"),
            )?;
            self.divided
                .mark_in_use(&mut self.directory, slot_ref, size as u32, caller, overhead);
            return Ok(());
        }

        let chunk = unsafe { self.fence.chunk_ptr(user_ptr.as_ptr()) };
        let block = self
            .directory
            .find(chunk as usize)
            .ok_or(DmallocError::NotInHeap)?;
        self.directory.descriptor_mut(block).payload = Payload::StartOfUser {
            size,
            caller,
            overhead,
        };
        self.directory.descriptor_mut(block).page_aligned = variant == Variant::Valloc;
        // `free_index::allocate` only marks continuation descriptors when it
        // split an existing free run; a fresh grow-from-the-page-source run
        // leaves them `Unused`, so stamp the whole run here regardless of
        // which path produced it.
        for offset in 1..run_len {
            let continuation = crate::block::BlockIndex(block.0 + offset);
            self.directory.descriptor_mut(continuation).payload =
                Payload::ContinuationOfUser { run_start: block };
        }
        Ok(())
    }

    fn resolve(&self, user_ptr: NonNull<u8>) -> Result<Resolved, DmallocError> {
        let chunk_raw = unsafe { self.fence.chunk_ptr(user_ptr.as_ptr()) };
        let chunk = NonNull::new(chunk_raw).ok_or(DmallocError::NotInHeap)?;
        let block = self
            .directory
            .find(chunk_raw as usize)
            .ok_or(DmallocError::NotInHeap)?;

        match &self.directory.descriptor(block).payload {
            Payload::DividedBlock { .. } => {
                let slot_ref = self.divided.resolve(&self.directory, block, chunk)?;
                let Payload::DividedBlock { class_bit, slots, .. } =
                    &self.directory.descriptor(block).payload
                else {
                    unreachable!()
                };
                match &slots[slot_ref.slot as usize] {
                    crate::block::MiniSlot::Free { .. } => Err(DmallocError::AlreadyFree),
                    crate::block::MiniSlot::InUse { size, caller, .. } => Ok(Resolved {
                        block,
                        chunk,
                        chunk_len: 1usize << class_bit,
                        size: *size as usize,
                        caller: *caller,
                        divided_slot: Some(slot_ref),
                        page_aligned: false,
                    }),
                }
            }
            Payload::StartOfUser { size, caller, .. } => {
                let descriptor = self.directory.descriptor(block);
                let expected_addr = if descriptor.page_aligned {
                    self.directory.address_of(block) + self.block_size - self.fence.bottom_len()
                } else {
                    self.directory.address_of(block)
                };
                if chunk_raw as usize != expected_addr {
                    return Err(DmallocError::NotStartBlock);
                }
                let chunk_len = if descriptor.page_aligned {
                    self.fence.overhead() + size
                } else {
                    let n = ((size + self.fence.overhead() + self.block_size - 1)
                        / self.block_size)
                        .max(1);
                    n * self.block_size
                };
                Ok(Resolved {
                    block,
                    chunk,
                    chunk_len,
                    size: *size,
                    caller: *caller,
                    divided_slot: None,
                    page_aligned: descriptor.page_aligned,
                })
            }
            Payload::ContinuationOfUser { .. } => Err(DmallocError::NotStartBlock),
            _ => Err(DmallocError::NotFound),
        }
    }

    /// `free(file, line, ptr)` (spec.md §4.6). `permit_null` mirrors the
    /// `free-NULL`-is-ok config choice (spec.md §9 Open Question).
    pub fn free(&mut self, ptr: *mut u8, permit_null: bool) -> Result<(), DmallocError> {
        self.counters.call_free += 1;
        let Some(user_ptr) = NonNull::new(ptr) else {
            return if permit_null {
                Ok(())
            } else {
                Err(DmallocError::IsNull)
            };
        };

        let resolved = self.resolve(user_ptr)?;
        // SAFETY: `chunk_len` was computed from the live descriptor/slot that
        // `resolve` just validated.
        unsafe {
            self.fence
                .check(resolved.chunk.as_ptr(), resolved.chunk_len)?
        };

        if let Some(byte) = self.poison_byte {
            let user_len = resolved.chunk_len - self.fence.overhead();
            // SAFETY: `user_ptr` is valid for `user_len` writes, the live
            // allocation's own user range.
            unsafe { user_ptr.as_ptr().write_bytes(byte, user_len) };
        }

        self.provenance.remove(&resolved.caller, resolved.size);
        self.counters
            .note_free(resolved.size as u64 + self.fence.overhead() as u64);

        let iteration = self.bump_iteration();
        if let Some(slot_ref) = resolved.divided_slot {
            self.divided.free(&mut self.directory, slot_ref, iteration)?;
        } else {
            let n = if resolved.page_aligned {
                let tail = ((resolved.size + self.fence.top_len() + self.block_size - 1)
                    / self.block_size)
                    .max(1) as u32;
                tail + 1
            } else {
                ((resolved.size + self.fence.overhead() + self.block_size - 1) / self.block_size)
                    .max(1) as u32
            };
            self.free_index.free(&mut self.directory, resolved.block, n, iteration);
        }
        Ok(())
    }

    /// `reallocate(file, line, old_ptr, new_size, clear_new_tail?)`
    /// (spec.md §4.6).
    pub fn reallocate(
        &mut self,
        old_ptr: *mut u8,
        new_size: usize,
        clear_new_tail: bool,
        caller: CallerKey,
    ) -> Result<NonNull<u8>, DmallocError> {
        self.counters.call_realloc += 1;
        let Some(old_user_ptr) = NonNull::new(old_ptr) else {
            return self.allocate(new_size, Variant::ReallocSide, caller);
        };

        let resolved = self.resolve(old_user_ptr)?;
        let old_overhead = self.fence.overhead();
        let new_inflated = new_size + old_overhead;

        let same_class = if let Some(slot_ref) = resolved.divided_slot {
            let Payload::DividedBlock { class_bit, .. } =
                &self.directory.descriptor(slot_ref.block).payload
            else {
                unreachable!()
            };
            !self.realloc_always_copy
                && new_inflated <= self.block_size / 2
                && ceil_log2(new_inflated.max(1) as u64) == *class_bit
        } else {
            let old_n = ((resolved.size + old_overhead + self.block_size - 1) / self.block_size)
                .max(1);
            let new_n =
                ((new_inflated + self.block_size - 1) / self.block_size).max(1);
            !self.realloc_always_copy && new_inflated > self.block_size / 2 && new_n == old_n
        };

        if same_class {
            let iteration = self.bump_iteration();
            let overhead_record = OverheadRecord::capture(
                self.seen_count(&caller),
                iteration,
                self.record_monotonics,
            );
            if let Some(slot_ref) = resolved.divided_slot {
                self.divided.mark_in_use(
                    &mut self.directory,
                    slot_ref,
                    new_size as u32,
                    caller,
                    overhead_record,
                );
            } else {
                self.directory.descriptor_mut(resolved.block).payload = Payload::StartOfUser {
                    size: new_size,
                    caller,
                    overhead: overhead_record,
                };
                let chunk_len = if resolved.page_aligned {
                    old_overhead + new_size
                } else {
                    let n = ((new_inflated + self.block_size - 1) / self.block_size).max(1);
                    n * self.block_size
                };
                // SAFETY: still within the same, already-owned reservation.
                unsafe { self.fence.write(resolved.chunk.as_ptr(), chunk_len) };
            }

            if clear_new_tail && new_size > resolved.size {
                // SAFETY: `old_user_ptr..+new_size` is this allocation's own
                // (possibly just-grown) user range.
                unsafe {
                    old_user_ptr
                        .as_ptr()
                        .add(resolved.size)
                        .write_bytes(0, new_size - resolved.size)
                };
            }

            self.provenance.remove(&resolved.caller, resolved.size);
            self.provenance.insert(caller, new_size);
            self.counters.bytes_in_use = self
                .counters
                .bytes_in_use
                .wrapping_add(new_size as u64)
                .wrapping_sub(resolved.size as u64);
            self.counters.bytes_peak = self.counters.bytes_peak.max(self.counters.bytes_in_use);
            return Ok(old_user_ptr);
        }

        let new_ptr = self.allocate(new_size, Variant::ReallocSide, caller)?;
        let copy_len = resolved.size.min(new_size);
        // SAFETY: both ranges are live, non-overlapping allocations of at
        // least `copy_len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(old_user_ptr.as_ptr(), new_ptr.as_ptr(), copy_len)
        };
        if clear_new_tail && new_size > copy_len {
            // SAFETY: tail of the freshly allocated, otherwise-uninitialized
            // (or fill-byte-painted) region.
            unsafe {
                new_ptr
                    .as_ptr()
                    .add(copy_len)
                    .write_bytes(0, new_size - copy_len)
            };
        }
        self.free(old_ptr, true)?;
        Ok(new_ptr)
    }
}

/// Slot length in bytes for the divided-block slot containing `chunk_ptr`.
fn slot_len(directory: &BlockDirectory, chunk_ptr: NonNull<u8>) -> usize {
    let Some(block) = directory.find(chunk_ptr.as_ptr() as usize) else {
        return 0;
    };
    match &directory.descriptor(block).payload {
        Payload::DividedBlock { class_bit, .. } => 1usize << class_bit,
        _ => 0,
    }
}

fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> AllocationCore {
        AllocationCore::new(4096, 4, 32, 64, FenceGuard::new(16, 16), SelectionPolicy::FirstFit, 64)
    }

    #[test]
    fn a_small_allocation_routes_through_the_divided_engine() {
        let mut core = core();
        let ptr = core
            .allocate(32, Variant::Malloc, CallerKey::Unknown)
            .unwrap();
        assert!(core.directory.find(ptr.as_ptr() as usize).is_some());
        assert_eq!(core.counters().points_out, 1);
    }

    #[test]
    fn a_large_allocation_routes_through_the_block_index() {
        let mut core = core();
        let ptr = core
            .allocate(8000, Variant::Malloc, CallerKey::Unknown)
            .unwrap();
        let block = core.directory.find(ptr.as_ptr() as usize).unwrap();
        assert!(matches!(
            core.directory.descriptor(block).payload,
            Payload::StartOfUser { .. }
        ));
    }

    #[test]
    fn calloc_zeros_the_user_range() {
        let mut core = core();
        let ptr = core
            .allocate(64, Variant::Calloc, CallerKey::Unknown)
            .unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_then_free_again_is_rejected() {
        let mut core = core();
        let ptr = core
            .allocate(32, Variant::Malloc, CallerKey::Unknown)
            .unwrap();
        core.free(ptr.as_ptr(), false).unwrap();
        assert_eq!(core.free(ptr.as_ptr(), false), Err(DmallocError::AlreadyFree));
    }

    #[test]
    fn null_free_honors_the_permit_flag() {
        let mut core = core();
        assert_eq!(core.free(std::ptr::null_mut(), false), Err(DmallocError::IsNull));
        assert!(core.free(std::ptr::null_mut(), true).is_ok());
    }

    #[test]
    fn reallocate_in_place_when_the_size_class_is_unchanged() {
        let mut core = core();
        let ptr = core
            .allocate(8000, Variant::Malloc, CallerKey::Unknown)
            .unwrap();
        let grown = core
            .reallocate(ptr.as_ptr(), 8001, false, CallerKey::Unknown)
            .unwrap();
        assert_eq!(ptr, grown);
    }

    #[test]
    fn reallocate_moves_when_the_size_class_changes() {
        let mut core = core();
        let ptr = core
            .allocate(16, Variant::Malloc, CallerKey::Unknown)
            .unwrap();
        unsafe { ptr.as_ptr().write(0xAB) };
        let grown = core
            .reallocate(ptr.as_ptr(), 8000, false, CallerKey::Unknown)
            .unwrap();
        assert_ne!(ptr, grown);
        assert_eq!(unsafe { grown.as_ptr().read() }, 0xAB);
        // old pointer is now free; a double free must be rejected. The old
        // descriptor stays `DividedBlock` (divided blocks are never
        // reassigned to `Unused`), so `resolve` finds a `Free` mini-slot and
        // reports `AlreadyFree`, not `NotFound`.
        assert_eq!(core.free(ptr.as_ptr(), false), Err(DmallocError::AlreadyFree));
    }

    #[test]
    fn zero_size_is_rejected_unless_explicitly_permitted() {
        let mut core = core();
        assert_eq!(
            core.allocate(0, Variant::Malloc, CallerKey::Unknown),
            Err(DmallocError::BadSize)
        );
        core.allow_zero_size = true;
        assert!(core.allocate(0, Variant::Malloc, CallerKey::Unknown).is_ok());
    }

    #[test]
    fn a_page_aligned_allocation_returns_a_block_aligned_pointer() {
        let mut core = core();
        let ptr = core
            .allocate(100, Variant::Valloc, CallerKey::Unknown)
            .unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
    }
}
