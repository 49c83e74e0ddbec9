//! Divided-block engine (spec.md §4.5): carves a basic block into equal
//! mini-slots for requests smaller than `BLOCK/2`, bypassing block-scale
//! waste.

use crate::block::{BlockIndex, MiniSlot, OverheadRecord, Payload};
use crate::caller::CallerKey;
use crate::directory::BlockDirectory;
use crate::error::DmallocError;
use crate::free_index::FreeBlockIndex;
use crate::page_source::PageSource;
use std::ptr::NonNull;

/// `(block, slot)` addresses one mini-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub block: BlockIndex,
    pub slot: u32,
}

pub struct DividedBlockEngine {
    block_size: usize,
    smallest_bit: u32,
    /// `free_lists[bit - smallest_bit]` holds every free slot of size
    /// `2^bit`, across every divided block of that class.
    free_lists: Vec<Vec<SlotRef>>,
    delayed_reuse: bool,
    reuse_delay: u64,
}

impl DividedBlockEngine {
    pub fn new(block_size: usize, smallest_bit: u32) -> Self {
        let largest_bit = ceil_log2(block_size as u64) - 1;
        let n_classes = (largest_bit - smallest_bit + 1) as usize;
        Self {
            block_size,
            smallest_bit,
            free_lists: (0..n_classes).map(|_| Vec::new()).collect(),
            delayed_reuse: false,
            reuse_delay: 0,
        }
    }

    pub fn set_delayed_reuse(&mut self, delay: u64) {
        self.delayed_reuse = delay > 0;
        self.reuse_delay = delay;
    }

    fn class_for(&self, byte_n: usize) -> usize {
        let bit = ceil_log2(byte_n as u64).max(self.smallest_bit);
        (bit - self.smallest_bit) as usize
    }

    fn slot_size(&self, class: usize) -> usize {
        1usize << (class as u32 + self.smallest_bit)
    }

    /// Allocate a `byte_n <= BLOCK/2` request, returning the raw slot
    /// pointer and the slot reference used to free it later.
    pub fn allocate(
        &mut self,
        directory: &mut BlockDirectory,
        free_index: &mut FreeBlockIndex,
        source: &mut PageSource,
        byte_n: usize,
        iteration: u64,
    ) -> Result<(NonNull<u8>, SlotRef), DmallocError> {
        let class = self.class_for(byte_n);

        if let Some(pos) = self.find_usable_slot(directory, class, iteration) {
            let slot_ref = self.free_lists[class].swap_remove(pos);
            return Ok((self.slot_ptr(directory, slot_ref), slot_ref));
        }

        self.grow(directory, free_index, source, class, iteration)?;
        let pos = self
            .find_usable_slot(directory, class, iteration)
            .expect("just grew this class, a free slot must exist");
        let slot_ref = self.free_lists[class].swap_remove(pos);
        Ok((self.slot_ptr(directory, slot_ref), slot_ref))
    }

    fn find_usable_slot(
        &self,
        directory: &BlockDirectory,
        class: usize,
        iteration: u64,
    ) -> Option<usize> {
        self.free_lists[class].iter().position(|slot_ref| {
            let Payload::DividedBlock { slots, .. } = &directory.descriptor(slot_ref.block).payload
            else {
                return false;
            };
            match &slots[slot_ref.slot as usize] {
                MiniSlot::Free { reuse_iter } => {
                    !self.delayed_reuse || reuse_iter.map_or(true, |r| r <= iteration)
                }
                MiniSlot::InUse { .. } => false,
            }
        })
    }

    fn grow(
        &mut self,
        directory: &mut BlockDirectory,
        free_index: &mut FreeBlockIndex,
        source: &mut PageSource,
        class: usize,
        iteration: u64,
    ) -> Result<(), DmallocError> {
        let block = free_index.allocate(directory, source, 1, iteration)?;
        let base = directory.address_of(block);
        let raw = NonNull::new(base as *mut u8).expect("block base is never null");
        let slot_size = self.slot_size(class);
        let n_slots = self.block_size / slot_size;

        let slots = (0..n_slots)
            .map(|_| MiniSlot::Free { reuse_iter: None })
            .collect();
        directory.descriptor_mut(block).payload = Payload::DividedBlock {
            class_bit: class as u32 + self.smallest_bit,
            raw,
            slots,
        };

        for slot in 0..n_slots as u32 {
            self.free_lists[class].push(SlotRef { block, slot });
        }
        Ok(())
    }

    fn slot_ptr(&self, directory: &BlockDirectory, slot_ref: SlotRef) -> NonNull<u8> {
        let Payload::DividedBlock { class_bit, raw, .. } =
            &directory.descriptor(slot_ref.block).payload
        else {
            unreachable!("slot_ptr called on a non-divided block")
        };
        let offset = slot_ref.slot as usize * (1usize << class_bit);
        // SAFETY: `offset < block_size` because `slot < n_slots`.
        unsafe { NonNull::new_unchecked(raw.as_ptr().add(offset)) }
    }

    /// Mark a slot in use, recording its provenance.
    pub fn mark_in_use(
        &self,
        directory: &mut BlockDirectory,
        slot_ref: SlotRef,
        size: u32,
        caller: CallerKey,
        overhead: OverheadRecord,
    ) {
        if let Payload::DividedBlock { slots, .. } =
            &mut directory.descriptor_mut(slot_ref.block).payload
        {
            slots[slot_ref.slot as usize] = MiniSlot::InUse {
                size,
                caller,
                overhead,
            };
        }
    }

    /// Locate the slot a pointer falls into, verifying it lands exactly on
    /// a slot boundary (spec.md: otherwise `NotOnBlock`).
    pub fn resolve(
        &self,
        directory: &BlockDirectory,
        block: BlockIndex,
        ptr: NonNull<u8>,
    ) -> Result<SlotRef, DmallocError> {
        let Payload::DividedBlock { class_bit, raw, .. } = &directory.descriptor(block).payload
        else {
            return Err(DmallocError::NotOnBlock);
        };
        let offset = ptr.as_ptr() as usize - raw.as_ptr() as usize;
        let slot_size = 1usize << class_bit;
        if offset % slot_size != 0 {
            return Err(DmallocError::NotOnBlock);
        }
        Ok(SlotRef {
            block,
            slot: (offset / slot_size) as u32,
        })
    }

    /// Free a slot: verify it is currently in use, mark it free with a
    /// delayed-reuse watermark, and file it on its class free list.
    pub fn free(
        &mut self,
        directory: &mut BlockDirectory,
        slot_ref: SlotRef,
        iteration: u64,
    ) -> Result<(), DmallocError> {
        let class_bit = {
            let Payload::DividedBlock { class_bit, slots, .. } =
                &mut directory.descriptor_mut(slot_ref.block).payload
            else {
                return Err(DmallocError::BadDblockPointer);
            };
            let slot = &mut slots[slot_ref.slot as usize];
            if slot.is_free() {
                return Err(DmallocError::AlreadyFree);
            }
            let watermark = self.delayed_reuse.then(|| iteration + self.reuse_delay);
            *slot = MiniSlot::Free {
                reuse_iter: watermark,
            };
            *class_bit
        };
        let class = (class_bit - self.smallest_bit) as usize;
        self.free_lists[class].push(slot_ref);
        Ok(())
    }

    /// Every class list, for the integrity checker's list cross-check.
    pub fn free_lists(&self) -> &[Vec<SlotRef>] {
        &self.free_lists
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

    fn setup() -> (BlockDirectory, FreeBlockIndex, PageSource, DividedBlockEngine) {
        let directory = BlockDirectory::new(4096, 64);
        let free_index = FreeBlockIndex::new(4096, 32, crate::free_index::SelectionPolicy::FirstFit);
        let source = PageSource::new(4096);
        let engine = DividedBlockEngine::new(4096, 4);
        (directory, free_index, source, engine)
    }

    #[test]
    fn allocate_carves_a_fresh_block_on_first_use() {
        let (mut directory, mut free_index, mut source, mut engine) = setup();
        let (ptr, slot_ref) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 0)
            .unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(slot_ref.slot, 0);
    }

    #[test]
    fn free_then_allocate_reuses_the_same_slot() {
        let (mut directory, mut free_index, mut source, mut engine) = setup();
        let (ptr1, slot_ref) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 0)
            .unwrap();
        engine.mark_in_use(
            &mut directory,
            slot_ref,
            16,
            CallerKey::Unknown,
            OverheadRecord::default(),
        );
        engine.free(&mut directory, slot_ref, 1).unwrap();

        let (ptr2, _) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 1)
            .unwrap();
        assert_eq!(ptr1, ptr2);
    }

    #[test]
    fn double_free_is_rejected_by_the_explicit_state_tag() {
        let (mut directory, mut free_index, mut source, mut engine) = setup();
        let (_, slot_ref) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 0)
            .unwrap();
        engine.mark_in_use(
            &mut directory,
            slot_ref,
            16,
            CallerKey::Unknown,
            OverheadRecord::default(),
        );
        engine.free(&mut directory, slot_ref, 1).unwrap();
        assert_eq!(
            engine.free(&mut directory, slot_ref, 2),
            Err(DmallocError::AlreadyFree)
        );
    }

    /// Regression test for the hazard spec.md §9 documents: a return
    /// address used as provenance can numerically alias a live heap
    /// pointer. Because free/in-use is an explicit tag (not a pointer
    /// comparison), this must never be confused with the slot being free.
    #[test]
    fn in_use_provenance_aliasing_a_heap_address_is_not_mistaken_for_free() {
        let (mut directory, mut free_index, mut source, mut engine) = setup();
        let (ptr, slot_ref) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 0)
            .unwrap();
        let aliasing_caller = CallerKey::ReturnAddr(ptr.as_ptr() as usize);
        engine.mark_in_use(
            &mut directory,
            slot_ref,
            16,
            aliasing_caller,
            OverheadRecord::default(),
        );

        let Payload::DividedBlock { slots, .. } = &directory.descriptor(slot_ref.block).payload
        else {
            panic!("expected a divided block");
        };
        assert!(!slots[slot_ref.slot as usize].is_free());
    }

    #[test]
    fn resolve_rejects_pointers_off_the_slot_grid() {
        let (mut directory, mut free_index, mut source, mut engine) = setup();
        let (ptr, slot_ref) = engine
            .allocate(&mut directory, &mut free_index, &mut source, 16, 0)
            .unwrap();
        let misaligned = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(1)) };
        assert_eq!(
            engine.resolve(&directory, slot_ref.block, misaligned),
            Err(DmallocError::NotOnBlock)
        );
    }
}
