//! Integrity checker (spec.md §4.7): full-heap walk and per-pointer walk.

use crate::block::{BlockIndex, Payload};
use crate::caller::CallerKey;
use crate::directory::BlockDirectory;
use crate::divided::DividedBlockEngine;
use crate::error::DmallocError;
use crate::fence::FenceGuard;
use crate::free_index::FreeBlockIndex;

/// Bounds on a recorded source-file path's length, spec.md §4.7 step 3
/// ("the recorded file pointer's length bounds"). Invented the same way
/// `fence.rs`'s tile bytes are: there's no original constant to carry over,
/// just a sanity window wide enough for any real call site and narrow
/// enough to catch a stomped pointer.
const FILE_LEN_MIN: usize = 1;
const FILE_LEN_MAX: usize = 4096;

/// Upper bound on a recorded source line number, spec.md §4.7 step 3.
const MAX_LINE_NUMBER: u32 = 1_000_000;

/// Settings that change what the walk verifies, mirroring the `check-*`
/// debug flags (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    pub cross_check_lists: bool,
    pub verify_poison: bool,
    pub poison_byte: u8,
    /// `LARGEST_BIT` from `context.rs`, needed to bound a `StartOfUser`
    /// size the same way `context.rs` bounds it at allocation time.
    pub largest_bit: u32,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            cross_check_lists: false,
            verify_poison: false,
            poison_byte: 0,
            largest_bit: 30,
        }
    }
}

/// Validate a recorded `(file, line)` pair, spec.md §4.7 step 3/step 5: file
/// length and line number must fall within sane bounds. `ReturnAddr`/
/// `Unknown` carry no file/line to validate (the "line is 0" address-only
/// convention spec.md describes).
fn check_caller_metadata(caller: &CallerKey) -> Result<(), DmallocError> {
    match caller {
        CallerKey::File { file, line } => {
            if !(FILE_LEN_MIN..=FILE_LEN_MAX).contains(&file.len()) {
                return Err(DmallocError::BadFile);
            }
            if *line > MAX_LINE_NUMBER {
                return Err(DmallocError::BadLine);
            }
            Ok(())
        }
        CallerKey::ReturnAddr(_) | CallerKey::Unknown => Ok(()),
    }
}

pub struct IntegrityChecker<'a> {
    directory: &'a BlockDirectory,
    free_index: &'a FreeBlockIndex,
    divided: &'a DividedBlockEngine,
    fence: &'a FenceGuard,
    options: CheckOptions,
}

impl<'a> IntegrityChecker<'a> {
    pub fn new(
        directory: &'a BlockDirectory,
        free_index: &'a FreeBlockIndex,
        divided: &'a DividedBlockEngine,
        fence: &'a FenceGuard,
        options: CheckOptions,
    ) -> Self {
        Self {
            directory,
            free_index,
            divided,
            fence,
            options,
        }
    }

    /// Walk every descriptor page and every descriptor in position order
    /// (spec.md §4.7, steps 1-6).
    pub fn check_heap(&self) -> Result<(), DmallocError> {
        self.check_descriptor_pages()?;

        let mut seen_free: std::collections::HashSet<BlockIndex> = std::collections::HashSet::new();
        for (index, descriptor) in self.directory.iter() {
            match &descriptor.payload {
                Payload::Unused | Payload::Administrative | Payload::External { .. } => {}
                Payload::StartOfUser { size, caller, .. } => {
                    self.check_start_of_user(index, *size, caller)?;
                }
                Payload::ContinuationOfUser { run_start } => {
                    self.check_continuation(index, *run_start)?;
                }
                Payload::Free { run_len, class_bit, .. } => {
                    seen_free.insert(index);
                    self.check_free_run(index, *run_len, *class_bit)?;
                }
                Payload::FreeContinuation { .. } => {}
                Payload::DividedBlock { .. } => {
                    self.check_divided_block(index)?;
                }
            }
        }

        if self.options.cross_check_lists {
            for class in self.free_index.classes() {
                for &index in class {
                    if !seen_free.contains(&index) {
                        return Err(DmallocError::BadFreeList);
                    }
                }
            }
        }
        Ok(())
    }

    fn check_descriptor_pages(&self) -> Result<(), DmallocError> {
        for page in self.directory.pages() {
            if page.magic_bottom != crate::directory::ADMIN_MAGIC_BOTTOM
                || page.magic_top != crate::directory::ADMIN_MAGIC_TOP
            {
                return Err(DmallocError::BadAdminMagic);
            }
        }
        for (i, page) in self.directory.pages().iter().enumerate() {
            let expected_next = if i + 1 < self.directory.pages().len() {
                Some(i + 1)
            } else {
                None
            };
            if page.next != expected_next {
                return Err(DmallocError::BadAdminList);
            }
        }
        Ok(())
    }

    fn check_start_of_user(
        &self,
        index: BlockIndex,
        size: usize,
        caller: &CallerKey,
    ) -> Result<(), DmallocError> {
        // The size recorded on a `StartOfUser` chunk is the raw user
        // request, but routing to the block-run path (rather than a
        // divided-block slot) is decided on `size + fence overhead` vs.
        // half a block (`core_alloc.rs::allocate`) — the same inflated
        // figure has to clear that bound here for the recorded size to be
        // internally consistent with which path produced this chunk.
        let half_block = block_size_hint(self.directory) / 2;
        let inflated = size + self.fence.overhead();
        if inflated <= half_block || size > (1usize << self.options.largest_bit) {
            return Err(DmallocError::BadSizeInfo);
        }
        check_caller_metadata(caller)?;

        let addr = self.directory.address_of(index);
        // SAFETY: `addr` is the chunk start of a live `StartOfUser`
        // descriptor, which is always backed by `size` readable bytes.
        unsafe { self.fence.check(addr as *const u8, size) }
    }

    fn check_continuation(
        &self,
        index: BlockIndex,
        run_start: BlockIndex,
    ) -> Result<(), DmallocError> {
        if index.get() <= run_start.get() {
            return Err(DmallocError::BadBlockOrder);
        }
        match &self.directory.descriptor(run_start).payload {
            Payload::StartOfUser { .. } => Ok(()),
            _ => Err(DmallocError::BadBlockOrder),
        }
    }

    fn check_free_run(
        &self,
        index: BlockIndex,
        run_len: u32,
        _class_bit: u32,
    ) -> Result<(), DmallocError> {
        // Coalescing invariant: neither neighbor may itself be free.
        if index.get() > 0 {
            let prev = self.directory.descriptor(BlockIndex(index.get() as u32 - 1));
            if matches!(prev.payload, Payload::Free { .. } | Payload::FreeContinuation { .. }) {
                return Err(DmallocError::FreeNonContig);
            }
        }
        let after = BlockIndex(index.get() as u32 + run_len);
        if after.get() < self.directory.block_count() {
            if matches!(
                self.directory.descriptor(after).payload,
                Payload::Free { .. }
            ) {
                return Err(DmallocError::FreeNonContig);
            }
        }

        if self.options.verify_poison {
            let addr = self.directory.address_of(index);
            let len = run_len as usize * block_size_hint(self.directory);
            // SAFETY: the run is entirely owned, unused memory.
            if !unsafe { all_bytes_equal(addr as *const u8, len, self.options.poison_byte) } {
                return Err(DmallocError::FreeOverwritten);
            }
        }
        Ok(())
    }

    fn check_divided_block(&self, index: BlockIndex) -> Result<(), DmallocError> {
        let Payload::DividedBlock { class_bit, raw, slots } = &self.directory.descriptor(index).payload
        else {
            unreachable!("check_divided_block called on a non-divided descriptor")
        };
        let slot_size = 1usize << *class_bit;
        let raw_ptr = raw.as_ptr();

        for (slot_idx, slot) in slots.iter().enumerate() {
            match slot {
                crate::block::MiniSlot::InUse { caller, .. } => {
                    check_caller_metadata(caller)?;
                    // SAFETY: every in-use slot owns `slot_size` readable
                    // bytes starting at its offset into the divided block.
                    unsafe {
                        self.fence
                            .check(raw_ptr.add(slot_idx * slot_size), slot_size)?;
                    }
                }
                crate::block::MiniSlot::Free { .. } => {
                    if self.options.cross_check_lists {
                        let found = self.divided.free_lists().iter().flatten().any(|sr| {
                            sr.block == index && sr.slot == slot_idx as u32
                        });
                        if !found {
                            return Err(DmallocError::BadFreeList);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Per-pointer check (spec.md §4.7): validate just the allocation
    /// containing `addr`. `loose` rounds down to the containing allocation
    /// instead of requiring an exact chunk-start match.
    pub fn check_pointer(&self, addr: usize, loose: bool) -> Result<(), DmallocError> {
        let index = self.directory.find(addr).ok_or(DmallocError::NotInHeap)?;
        match &self.directory.descriptor(index).payload {
            Payload::StartOfUser { size, caller, .. } => {
                self.check_start_of_user(index, *size, caller)
            }
            Payload::DividedBlock { .. } => self.check_divided_block(index),
            _ if loose => Ok(()),
            _ => Err(DmallocError::NotFound),
        }
    }
}

fn block_size_hint(directory: &BlockDirectory) -> usize {
    // The directory doesn't expose `block_size` directly (it's an
    // implementation detail of addressing), but two consecutive blocks
    // always differ by exactly one block size, which the checker can
    // recover without a dedicated accessor.
    if directory.block_count() >= 2 {
        directory.address_of(BlockIndex(1)) - directory.address_of(BlockIndex(0))
    } else {
        0
    }
}

/// # Safety
/// `ptr` must be valid for `len` reads.
unsafe fn all_bytes_equal(ptr: *const u8, len: usize, byte: u8) -> bool {
    for i in 0..len {
        // SAFETY: forwarded from the caller's guarantee.
        if unsafe { ptr.add(i).read() } != byte {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::CallerKey;
    use crate::block::OverheadRecord;
    use crate::page_source::PageSource;

    fn setup() -> (BlockDirectory, FreeBlockIndex, DividedBlockEngine, PageSource, FenceGuard) {
        (
            BlockDirectory::new(4096, 64),
            FreeBlockIndex::new(4096, 32, crate::free_index::SelectionPolicy::FirstFit),
            DividedBlockEngine::new(4096, 4),
            PageSource::new(4096),
            FenceGuard::new(8, 8),
        )
    }

    #[test]
    fn a_fresh_heap_with_one_clean_allocation_passes() {
        let (mut directory, mut free_index, divided, mut source, fence) = setup();
        let block = free_index.allocate(&mut directory, &mut source, 1, 0).unwrap();
        let addr = directory.address_of(block);
        unsafe { fence.write(addr as *mut u8, 4096) };
        directory.descriptor_mut(block).payload = Payload::StartOfUser {
            size: 4096,
            caller: CallerKey::Unknown,
            overhead: OverheadRecord::default(),
        };

        let checker = IntegrityChecker::new(
            &directory,
            &free_index,
            &divided,
            &fence,
            CheckOptions::default(),
        );
        assert!(checker.check_heap().is_ok());
    }

    #[test]
    fn a_corrupted_fence_is_caught_by_the_full_walk() {
        let (mut directory, mut free_index, divided, mut source, fence) = setup();
        let block = free_index.allocate(&mut directory, &mut source, 1, 0).unwrap();
        let addr = directory.address_of(block);
        unsafe {
            fence.write(addr as *mut u8, 4096);
            (addr as *mut u8).add(4095).write(0xFF);
        }
        directory.descriptor_mut(block).payload = Payload::StartOfUser {
            size: 4096,
            caller: CallerKey::Unknown,
            overhead: OverheadRecord::default(),
        };

        let checker = IntegrityChecker::new(
            &directory,
            &free_index,
            &divided,
            &fence,
            CheckOptions::default(),
        );
        assert_eq!(checker.check_heap(), Err(DmallocError::OverFence));
    }
}
